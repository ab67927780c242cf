//! Control channel of a local Tor instance
//!
//! Speaks the line-based control protocol over TCP: authenticate, request a
//! new identity and read circuit status. Each operation opens its own
//! connection so a stuck session never outlives one call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::RotationError;
use crate::models::ExitNode;

type ControlResult<T> = std::result::Result<T, RotationError>;

/// Out-of-band channel used to rotate one endpoint's circuit
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Authenticate and ask for a fresh circuit
    async fn new_identity(&self) -> ControlResult<()>;

    /// Exit relay of the first built circuit, if any
    async fn exit_node(&self) -> ControlResult<Option<ExitNode>>;
}

/// How to authenticate to the control port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAuth {
    Password(String),
    Cookie(PathBuf),
    /// Discover the method with `PROTOCOLINFO`
    Auto,
}

/// [`ControlChannel`] talking to a real Tor control port
#[derive(Debug, Clone)]
pub struct TorControlChannel {
    addr: String,
    auth: ControlAuth,
    timeout: Duration,
}

impl TorControlChannel {
    pub fn new(addr: impl Into<String>, auth: ControlAuth, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            auth,
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn session<T, F, Fut>(&self, op: F) -> ControlResult<T>
    where
        F: FnOnce(ControlConnection) -> Fut,
        Fut: std::future::Future<Output = ControlResult<T>>,
    {
        let work = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| RotationError::Unreachable(format!("{}: {}", self.addr, e)))?;
            let mut conn = ControlConnection::new(stream);
            conn.authenticate(&self.auth).await?;
            op(conn).await
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| RotationError::Unreachable(format!("{}: timed out", self.addr)))?
    }
}

#[async_trait]
impl ControlChannel for TorControlChannel {
    async fn new_identity(&self) -> ControlResult<()> {
        self.session(|mut conn| async move {
            conn.command("SIGNAL NEWNYM").await?.expect_ok()?;
            conn.quit().await;
            Ok(())
        })
        .await
    }

    async fn exit_node(&self) -> ControlResult<Option<ExitNode>> {
        self.session(|mut conn| async move {
            let reply = conn.command("GETINFO circuit-status").await?.expect_ok()?;
            conn.quit().await;
            Ok(parse_circuit_status(&reply.lines))
        })
        .await
    }
}

/// A complete control-port reply
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn expect_ok(self) -> ControlResult<Self> {
        if self.code == 250 {
            Ok(self)
        } else {
            Err(RotationError::Rejected(self.summary()))
        }
    }

    fn summary(&self) -> String {
        format!("{} {}", self.code, self.lines.last().map(String::as_str).unwrap_or(""))
    }
}

struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConnection {
    fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    async fn command(&mut self, command: &str) -> ControlResult<Reply> {
        self.writer
            .write_all(format!("{}\r\n", command).as_bytes())
            .await
            .map_err(io_unreachable)?;
        self.writer.flush().await.map_err(io_unreachable)?;
        read_reply(&mut self.reader).await
    }

    async fn authenticate(&mut self, auth: &ControlAuth) -> ControlResult<()> {
        let command = match auth {
            ControlAuth::Password(password) => {
                format!("AUTHENTICATE {}", quote(password))
            }
            ControlAuth::Cookie(path) => format!("AUTHENTICATE {}", read_cookie(path).await?),
            ControlAuth::Auto => {
                let info = self.command("PROTOCOLINFO 1").await?.expect_ok()?;
                let methods = AuthMethods::parse(&info.lines);
                debug!(methods = ?methods.methods, "Control port auth methods");

                if methods.supports("NULL") {
                    "AUTHENTICATE".to_string()
                } else if let (true, Some(path)) = (methods.supports("COOKIE"), methods.cookie_file)
                {
                    format!("AUTHENTICATE {}", read_cookie(Path::new(&path)).await?)
                } else {
                    return Err(RotationError::AuthFailed(
                        "no supported authentication method offered".to_string(),
                    ));
                }
            }
        };

        let reply = self.command(&command).await?;
        match reply.code {
            250 => Ok(()),
            515 => Err(RotationError::AuthFailed(reply.summary())),
            _ => Err(RotationError::Rejected(reply.summary())),
        }
    }

    async fn quit(&mut self) {
        // The reply is irrelevant once the real command has succeeded
        let _ = self.command("QUIT").await;
    }
}

/// Read one reply: `NNN-` continues, `NNN+` opens a data block ended by `.`,
/// `NNN ` ends the reply
async fn read_reply<R>(reader: &mut R) -> ControlResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();

    loop {
        let line = read_line(reader).await?;
        let (code, rest) = line
            .split_at_checked(3)
            .ok_or_else(|| RotationError::Rejected(format!("malformed reply line: {:?}", line)))?;
        let code: u16 = code
            .parse()
            .map_err(|_| RotationError::Rejected(format!("malformed reply code: {:?}", line)))?;

        let mut chars = rest.chars();
        let separator = chars.next().unwrap_or(' ');
        lines.push(chars.as_str().to_string());

        match separator {
            ' ' => return Ok(Reply { code, lines }),
            '-' => continue,
            '+' => loop {
                let data = read_line(reader).await?;
                if data == "." {
                    break;
                }
                let data = data.strip_prefix('.').unwrap_or(&data);
                lines.push(data.to_string());
            },
            other => {
                return Err(RotationError::Rejected(format!(
                    "unexpected reply separator {:?}",
                    other
                )))
            }
        }
    }
}

async fn read_line<R>(reader: &mut R) -> ControlResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.map_err(io_unreachable)?;
    if n == 0 {
        return Err(RotationError::Unreachable(
            "control connection closed".to_string(),
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Parsed `PROTOCOLINFO` auth line
#[derive(Debug, Default)]
struct AuthMethods {
    methods: Vec<String>,
    cookie_file: Option<String>,
}

impl AuthMethods {
    fn parse(lines: &[String]) -> Self {
        let mut parsed = Self::default();

        for line in lines {
            let Some(rest) = line.strip_prefix("AUTH ") else {
                continue;
            };
            if let Some(methods) = rest.strip_prefix("METHODS=") {
                let methods = methods.split_whitespace().next().unwrap_or("");
                parsed.methods = methods.split(',').map(|m| m.to_uppercase()).collect();
            }
            if let Some(idx) = rest.find("COOKIEFILE=\"") {
                let value = &rest[idx + "COOKIEFILE=\"".len()..];
                parsed.cookie_file = unquote(value);
            }
        }

        parsed
    }

    fn supports(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Exit relay of the first `BUILT` circuit in a `circuit-status` reply
fn parse_circuit_status(lines: &[String]) -> Option<ExitNode> {
    lines
        .iter()
        .map(|line| line.strip_prefix("circuit-status=").unwrap_or(line))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            if fields.next()? != "BUILT" {
                return None;
            }
            let exit = fields.next()?.split(',').last()?;
            let exit = exit.strip_prefix('$').unwrap_or(exit);
            let (fingerprint, nickname) = match exit.split_once(['~', '=']) {
                Some((fp, nick)) => (fp, Some(nick.to_string())),
                None => (exit, None),
            };
            Some(ExitNode {
                fingerprint: fingerprint.to_string(),
                nickname,
            })
        })
}

async fn read_cookie(path: &Path) -> ControlResult<String> {
    let cookie = tokio::fs::read(path).await.map_err(|e| {
        RotationError::AuthFailed(format!("cannot read cookie {}: {}", path.display(), e))
    })?;
    Ok(cookie.iter().map(|b| format!("{:02X}", b)).collect())
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Value of a quoted string, given the text after its opening quote
fn unquote(value: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return Some(out),
            c => out.push(c),
        }
    }
    None
}

fn io_unreachable(err: std::io::Error) -> RotationError {
    RotationError::Unreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Minimal control port: answers each received command from a script
    async fn fake_control_port(
        script: Vec<(&'static str, &'static str)>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);

            for (expected_prefix, response) in script {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                let line = line.trim_end().to_string();
                assert!(
                    line.starts_with(expected_prefix),
                    "unexpected command {:?}",
                    line
                );
                log.lock().await.push(line);
                write.write_all(response.as_bytes()).await.unwrap();
            }
        });

        (addr, received)
    }

    #[tokio::test]
    async fn test_new_identity_with_password() {
        let (addr, received) = fake_control_port(vec![
            ("AUTHENTICATE", "250 OK\r\n"),
            ("SIGNAL NEWNYM", "250 OK\r\n"),
            ("QUIT", "250 closing connection\r\n"),
        ])
        .await;

        let channel = TorControlChannel::new(
            addr,
            ControlAuth::Password("s3\"cret".to_string()),
            Duration::from_secs(2),
        );
        channel.new_identity().await.unwrap();

        let received = received.lock().await;
        assert_eq!(received[0], "AUTHENTICATE \"s3\\\"cret\"");
        assert_eq!(received[1], "SIGNAL NEWNYM");
    }

    #[tokio::test]
    async fn test_auth_rejected_is_auth_failed() {
        let (addr, _) = fake_control_port(vec![(
            "AUTHENTICATE",
            "515 Authentication failed: Password did not match HashedControlPassword\r\n",
        )])
        .await;

        let channel = TorControlChannel::new(
            addr,
            ControlAuth::Password("wrong".to_string()),
            Duration::from_secs(2),
        );
        let err = channel.new_identity().await.unwrap_err();
        assert!(matches!(err, RotationError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_newnym_rejected() {
        let (addr, _) = fake_control_port(vec![
            ("AUTHENTICATE", "250 OK\r\n"),
            ("SIGNAL NEWNYM", "552 Unrecognized signal\r\n"),
        ])
        .await;

        let channel = TorControlChannel::new(
            addr,
            ControlAuth::Password("pw".to_string()),
            Duration::from_secs(2),
        );
        let err = channel.new_identity().await.unwrap_err();
        assert!(matches!(err, RotationError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_control_port() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let channel = TorControlChannel::new(addr, ControlAuth::Auto, Duration::from_secs(2));
        let err = channel.new_identity().await.unwrap_err();
        assert!(matches!(err, RotationError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_auto_auth_with_null_method_and_exit_node() {
        let (addr, received) = fake_control_port(vec![
            (
                "PROTOCOLINFO",
                "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.8.9\"\r\n250 OK\r\n",
            ),
            ("AUTHENTICATE", "250 OK\r\n"),
            (
                "GETINFO circuit-status",
                "250+circuit-status=\r\n\
                 3 EXTENDED $AAAA~guard PURPOSE=GENERAL\r\n\
                 5 BUILT $AAAA~guard,$BBBB~middle,$CCCC~exitrelay BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\r\n\
                 .\r\n250 OK\r\n",
            ),
            ("QUIT", "250 closing connection\r\n"),
        ])
        .await;

        let channel = TorControlChannel::new(addr, ControlAuth::Auto, Duration::from_secs(2));
        let exit = channel.exit_node().await.unwrap();

        assert_eq!(
            exit,
            Some(ExitNode {
                fingerprint: "CCCC".to_string(),
                nickname: Some("exitrelay".to_string()),
            })
        );
        assert_eq!(received.lock().await[1], "AUTHENTICATE");
    }

    #[tokio::test]
    async fn test_read_reply_multiline() {
        let raw = b"250-first\r\n250+data=\r\nline one\r\n..dotted\r\n.\r\n250 OK\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let reply = read_reply(&mut reader).await.unwrap();

        assert_eq!(reply.code, 250);
        assert_eq!(
            reply.lines,
            vec!["first", "data=", "line one", ".dotted", "OK"]
        );
    }

    #[test]
    fn test_parse_protocol_info() {
        let lines = vec![
            "PROTOCOLINFO 1".to_string(),
            "AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/run/tor/control.authcookie\"".to_string(),
            "OK".to_string(),
        ];
        let methods = AuthMethods::parse(&lines);

        assert!(methods.supports("COOKIE"));
        assert!(!methods.supports("NULL"));
        assert_eq!(
            methods.cookie_file.as_deref(),
            Some("/run/tor/control.authcookie")
        );
    }

    #[test]
    fn test_parse_circuit_status_without_built_circuit() {
        let lines = vec!["circuit-status=1 LAUNCHED PURPOSE=GENERAL".to_string()];
        assert_eq!(parse_circuit_status(&lines), None);
    }
}
