//! Search fan-out and scrape task builders
//!
//! Turns a query into one task per onion search engine, and search hits into
//! scrape tasks. Both batches run on the same dispatcher.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::error::{FetchError, Result};
use crate::fetch::aggregator::ResultAggregator;
use crate::fetch::parser::{OnionLinkParser, PageTextParser};
use crate::models::{expand_template, FetchResult, FetchTask, ParsedBody, SearchHit};
use crate::proxy::health::HealthReport;

/// An onion search engine queried by URL template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEngine {
    pub id: String,
    pub name: String,
    /// Search URL with a `{query}` placeholder
    pub url_template: String,
    /// Lower is tried first
    pub priority: u8,
    pub enabled: bool,
}

impl SearchEngine {
    fn builtin(id: &str, name: &str, url_template: &str, priority: u8) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url_template: url_template.to_string(),
            priority,
            enabled: true,
        }
    }

    /// Root URL of the engine, used for liveness probes
    pub fn probe_url(&self) -> Option<String> {
        let url = Url::parse(&expand_template(&self.url_template, "")).ok()?;
        Some(format!("{}://{}/", url.scheme(), url.host_str()?))
    }
}

/// Built-in engine catalog, sorted by priority
pub fn default_engines() -> Vec<SearchEngine> {
    let mut engines = vec![
        SearchEngine::builtin(
            "ahmia",
            "Ahmia",
            "http://juhanurmihxlp77nkq76byazcldy2hlmovfu2epvl5ankdibsot4csyd.onion/search/?q={query}",
            1,
        ),
        SearchEngine::builtin(
            "onionland",
            "OnionLand",
            "http://3bbad7fauom4d6sgppalyqddsqbf5u5p56b5k5uk2zxsy3d6ey2jobad.onion/search?q={query}",
            1,
        ),
        SearchEngine::builtin(
            "darkrunt",
            "DarkRunt",
            "http://darkhuntyla64h75a3re5e2l3367lqn7ltmdzpgmr6b4nbz3q2iaxrid.onion/search?q={query}",
            2,
        ),
        SearchEngine::builtin(
            "torgle",
            "Torgle",
            "http://iy3544gmoeclh5de6gez2256v6pjh4omhpqdh2wpeeppjtvqmjhkfwad.onion/torgle/?query={query}",
            1,
        ),
        SearchEngine::builtin(
            "amnesia",
            "Amnesia",
            "http://amnesia7u5odx5xbwtpnqk3edybgud5bmiagu75bnqx2crntw5kry7ad.onion/search?query={query}",
            2,
        ),
        SearchEngine::builtin(
            "kaizer",
            "Kaizer",
            "http://kaizerwfvp5gxu6cppibp7jhcqptavq3iqef66wbxenh6a2fklibdvid.onion/search?q={query}",
            2,
        ),
        SearchEngine::builtin(
            "anima",
            "Anima",
            "http://anima4ffe27xmakwnseih3ic2y7y3l6e7fucwk4oerdn4odf7k74tbid.onion/search?q={query}",
            2,
        ),
        SearchEngine::builtin(
            "tornado",
            "Tornado",
            "http://tornadoxn3viscgz647shlysdy7ea5zqzwda7hierekeuokh5eh5b3qd.onion/search?q={query}",
            2,
        ),
        SearchEngine::builtin(
            "tornet",
            "TorNet",
            "http://tornetupfu7gcgidt33ftnungxzyfq2pygui5qdoyss34xbgx2qruzid.onion/search?q={query}",
            2,
        ),
        SearchEngine::builtin(
            "torland",
            "Torland",
            "http://torlbmqwtudkorme6prgfpmsnile7ug2zm4u3ejpcncxuhpu4k2j4kyd.onion/index.php?a=search&q={query}",
            2,
        ),
        SearchEngine::builtin(
            "findtor",
            "Find Tor",
            "http://findtorroveq5wdnipkaojfpqulxnkhblymc7aramjzajcvpptd4rjqd.onion/search?q={query}",
            2,
        ),
        SearchEngine::builtin(
            "excavator",
            "Excavator",
            "http://2fd6cemt4gmccflhm6imvdfvli3nf7zn6rfrwpsy7uhxrgbypvwf5fad.onion/search?query={query}",
            2,
        ),
        SearchEngine::builtin(
            "onionway",
            "Onionway",
            "http://oniwayzz74cv2puhsgx4dpjwieww4wdphsydqvf5q7eyz4myjvyw26ad.onion/search.php?s={query}",
            2,
        ),
        SearchEngine::builtin(
            "tor66",
            "Tor66",
            "http://tor66sewebgixwhcqfnp5inzp5x5uohhdy3kvtnyfxc2e5mxiuh34iid.onion/search?q={query}",
            2,
        ),
        SearchEngine::builtin(
            "oss",
            "OSS (Onion Search Server)",
            "http://3fzh7yuupdfyjhwt3ugzqqof6ulbcl27ecev33knxe3u7goi3vfn2qqd.onion/oss/index.php?search={query}",
            2,
        ),
    ];

    engines.sort_by_key(|e| e.priority);
    engines
}

/// Enabled engines with live ones first, each group keeping its order
pub fn order_by_health(engines: &[SearchEngine], report: &HealthReport) -> Vec<SearchEngine> {
    let alive = report.alive_targets();
    let (healthy, unhealthy): (Vec<_>, Vec<_>) = engines
        .iter()
        .filter(|e| e.enabled)
        .cloned()
        .partition(|e| e.probe_url().is_some_and(|url| alive.contains(url.as_str())));

    healthy.into_iter().chain(unhealthy).collect()
}

/// Probe URLs of the enabled engines
pub fn probe_targets(engines: &[SearchEngine]) -> Vec<String> {
    engines
        .iter()
        .filter(|e| e.enabled)
        .filter_map(SearchEngine::probe_url)
        .collect()
}

/// One anonymized link-extraction task per enabled engine
pub fn search_tasks(query: &str, engines: &[SearchEngine], config: &Config) -> Result<Vec<FetchTask>> {
    let query = query.trim();
    if query.is_empty() {
        return Err(FetchError::InvalidTarget("search query is empty".into()));
    }

    let parser = Arc::new(OnionLinkParser);
    Ok(engines
        .iter()
        .filter(|e| e.enabled)
        .map(|engine| {
            FetchTask::from_template(&engine.url_template, query)
                .anonymized(true)
                .max_attempts(config.fetch.max_attempts)
                .timeout(config.fetch.search_timeout)
                .attempt_timeout(config.fetch.attempt_timeout)
                .parser(parser.clone())
        })
        .collect())
}

/// One page-text task per hit; only onion hosts go through the proxy
pub fn scrape_tasks(hits: &[SearchHit], config: &Config) -> Vec<FetchTask> {
    hits.iter()
        .map(|hit| {
            let parser = PageTextParser::new(config.fetch.scrape_max_chars).with_title(&hit.title);
            FetchTask::new(&hit.link)
                .anonymized(is_onion(&hit.link))
                .max_attempts(config.fetch.max_attempts)
                .timeout(config.fetch.scrape_timeout)
                .attempt_timeout(config.fetch.attempt_timeout)
                .parser(Arc::new(parser))
        })
        .collect()
}

/// Hits from every successful search result, deduplicated across engines
pub fn collect_hits<'a>(results: impl IntoIterator<Item = &'a FetchResult>) -> Vec<SearchHit> {
    let hits = results
        .into_iter()
        .filter_map(FetchResult::payload)
        .flat_map(|payload| match &payload.body {
            ParsedBody::Links(links) => links.clone(),
            _ => Vec::new(),
        });

    ResultAggregator::merge_hits(hits)
}

/// Whether the URL's host is a hidden service
pub fn is_onion(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => url
            .host_str()
            .is_some_and(|host| host.to_ascii_lowercase().ends_with(".onion")),
        Err(_) => raw.contains(".onion"),
    }
}
