//! PBX manager-protocol provider
//!
//! Asterisk-style manager interface over TCP: `Key: Value` CRLF blocks
//! terminated by a blank line. Each call opens one session (connect,
//! Login, Originate, Logoff, disconnect). Messages are not supported on
//! this backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::PbxConfig;

use super::{DispatchReceipt, Provider, ProviderError};

/// PBX manager-protocol client
pub struct PbxProvider {
    host: String,
    port: u16,
    username: String,
    secret: String,
    channel: String,
    context: String,
    extension: String,
    connect_timeout: Duration,
    originate_timeout_secs: u32,
}

impl PbxProvider {
    /// Create a new client from configuration
    ///
    /// Reads the manager secret from the environment variable the config
    /// names.
    pub fn from_config(config: &PbxConfig) -> Result<Self, ProviderError> {
        debug!(host = %config.host, port = config.port, "from_config: called");
        let secret = config.secret().map_err(|e| ProviderError::NotConfigured(e.to_string()))?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            secret,
            channel: config.channel.clone(),
            context: config.context.clone(),
            extension: config.extension.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            originate_timeout_secs: config.originate_timeout_secs,
        })
    }

    /// Connect and authenticate a fresh manager session
    async fn open_session(&self) -> Result<ManagerSession<TcpStream>, ProviderError> {
        debug!(host = %self.host, port = self.port, "open_session: called");
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ProviderError::Timeout(self.connect_timeout))??;

        ManagerSession::login(stream, &self.username, &self.secret).await
    }
}

#[async_trait]
impl Provider for PbxProvider {
    async fn place_call(
        &self,
        destination: &str,
        caller_id: &str,
        request_id: &str,
    ) -> Result<DispatchReceipt, ProviderError> {
        debug!(%destination, %request_id, "place_call: called");
        let mut session = self.open_session().await?;

        let channel = self.channel.replace("{number}", destination);
        let timeout_ms = (self.originate_timeout_secs as u64 * 1000).to_string();
        let fields = [
            ("Channel", channel.as_str()),
            ("Context", self.context.as_str()),
            ("Exten", self.extension.as_str()),
            ("Priority", "1"),
            ("CallerID", caller_id),
            ("Timeout", timeout_ms.as_str()),
            ("Async", "true"),
            ("ActionID", request_id),
        ];
        let response = session.send_action("Originate", &fields).await?;

        // Goodbye is not an error; ignore the logoff reply entirely
        let _ = session.send_action("Logoff", &[]).await;

        if !response.is_success() {
            warn!(%request_id, message = response.message(), "place_call: originate rejected");
            return Err(ProviderError::Protocol(format!(
                "Originate rejected: {}",
                response.message()
            )));
        }

        let reference = response
            .get("actionid")
            .map(String::from)
            .unwrap_or_else(|| format!("originate-{}", request_id));

        Ok(DispatchReceipt {
            reference,
            status: "originated".to_string(),
        })
    }

    async fn send_message(
        &self,
        _destination: &str,
        _sender: &str,
        _body: &str,
    ) -> Result<DispatchReceipt, ProviderError> {
        debug!("send_message: called");
        Err(ProviderError::Unsupported(
            "PBX provider cannot send messages".to_string(),
        ))
    }

    async fn is_ready(&self) -> bool {
        match self.open_session().await {
            Ok(mut session) => {
                let _ = session.send_action("Logoff", &[]).await;
                true
            }
            Err(e) => {
                debug!(error = %e, "is_ready: probe failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "pbx"
    }
}

/// One authenticated manager connection
struct ManagerSession<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ManagerSession<S> {
    /// Consume the greeting line and authenticate
    async fn login(stream: S, username: &str, secret: &str) -> Result<Self, ProviderError> {
        let mut session = Self {
            stream: BufReader::new(stream),
        };

        // The manager greets with a single version line, no terminator block
        let mut greeting = String::new();
        let n = session.stream.read_line(&mut greeting).await?;
        if n == 0 {
            return Err(ProviderError::Protocol("Connection closed before greeting".to_string()));
        }
        debug!(greeting = greeting.trim_end(), "login: connected");

        let response = session
            .send_action("Login", &[("Username", username), ("Secret", secret)])
            .await?;
        if !response.is_success() {
            return Err(ProviderError::Protocol(format!(
                "Login rejected: {}",
                response.message()
            )));
        }

        Ok(session)
    }

    /// Write one action block and read the response block
    async fn send_action(&mut self, action: &str, fields: &[(&str, &str)]) -> Result<ManagerResponse, ProviderError> {
        debug!(%action, "send_action: called");
        let block = action_block(action, fields);
        self.stream.write_all(block.as_bytes()).await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    /// Read `Key: Value` lines up to the blank terminator
    async fn read_response(&mut self) -> Result<ManagerResponse, ProviderError> {
        let mut fields = HashMap::new();

        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(ProviderError::Protocol("Connection closed mid-response".to_string()));
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        Ok(ManagerResponse { fields })
    }
}

/// Format one `Action:` block with CRLF line endings and blank terminator
fn action_block(action: &str, fields: &[(&str, &str)]) -> String {
    let mut block = format!("Action: {}\r\n", action);
    for (key, value) in fields {
        block.push_str(key);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    block
}

/// Parsed response block, keys lowercased
struct ManagerResponse {
    fields: HashMap<String, String>,
}

impl ManagerResponse {
    fn is_success(&self) -> bool {
        self.fields
            .get("response")
            .is_some_and(|r| r.eq_ignore_ascii_case("success"))
    }

    fn message(&self) -> &str {
        self.fields.get("message").map(String::as_str).unwrap_or("")
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_provider(port: u16) -> PbxProvider {
        PbxProvider {
            host: "127.0.0.1".to_string(),
            port,
            username: "orchestrator".to_string(),
            secret: "hunter2".to_string(),
            channel: "SIP/trunk/{number}".to_string(),
            context: "callbacks".to_string(),
            extension: "s".to_string(),
            connect_timeout: Duration::from_secs(2),
            originate_timeout_secs: 20,
        }
    }

    async fn read_block<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut BufReader<S>) -> String {
        let mut block = String::new();
        loop {
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            if line.trim_end().is_empty() {
                break;
            }
            block.push_str(&line);
        }
        block
    }

    /// Scripted manager peer accepting one session
    async fn scripted_server(listener: TcpListener, originate_response: &'static str) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);

        stream.write_all(b"Asterisk Call Manager/5.0.1\r\n").await.unwrap();

        let login = read_block(&mut stream).await;
        assert!(login.contains("Action: Login"));
        assert!(login.contains("Username: orchestrator"));
        assert!(login.contains("Secret: hunter2"));
        stream
            .write_all(b"Response: Success\r\nMessage: Authentication accepted\r\n\r\n")
            .await
            .unwrap();

        let originate = read_block(&mut stream).await;
        assert!(originate.contains("Action: Originate"));
        assert!(originate.contains("Channel: SIP/trunk/+13217047403"));
        assert!(originate.contains("Context: callbacks"));
        assert!(originate.contains("Timeout: 20000"));
        assert!(originate.contains("ActionID: req-1"));
        stream.write_all(originate_response.as_bytes()).await.unwrap();

        let logoff = read_block(&mut stream).await;
        assert!(logoff.contains("Action: Logoff"));
        stream.write_all(b"Response: Goodbye\r\n\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_place_call_happy_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(scripted_server(
            listener,
            "Response: Success\r\nActionID: req-1\r\nMessage: Originate successfully queued\r\n\r\n",
        ));

        let provider = test_provider(port);
        let receipt = provider
            .place_call("+13217047403", "+15550002222", "req-1")
            .await
            .unwrap();

        assert_eq!(receipt.reference, "req-1");
        assert_eq!(receipt.status, "originated");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_place_call_originate_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(scripted_server(
            listener,
            "Response: Error\r\nMessage: Extension does not exist\r\n\r\n",
        ));

        let provider = test_provider(port);
        let result = provider.place_call("+13217047403", "+15550002222", "req-1").await;

        match result {
            Err(ProviderError::Protocol(message)) => {
                assert!(message.contains("Extension does not exist"));
            }
            other => panic!("Expected protocol error, got {:?}", other.map(|r| r.reference)),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            stream.write_all(b"Asterisk Call Manager/5.0.1\r\n").await.unwrap();
            let _ = read_block(&mut stream).await;
            stream
                .write_all(b"Response: Error\r\nMessage: Authentication failed\r\n\r\n")
                .await
                .unwrap();
        });

        let provider = test_provider(port);
        let result = provider.place_call("+13217047403", "+15550002222", "req-1").await;

        match result {
            Err(ProviderError::Protocol(message)) => assert!(message.contains("Authentication failed")),
            other => panic!("Expected protocol error, got {:?}", other.map(|r| r.reference)),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_message_unsupported() {
        let provider = test_provider(1);
        let result = provider.send_message("+13217047403", "+15550002222", "hi").await;
        assert!(matches!(result, Err(ProviderError::Unsupported(_))));
    }

    #[test]
    fn test_action_block_format() {
        let block = action_block("Login", &[("Username", "bob"), ("Secret", "x")]);
        assert_eq!(block, "Action: Login\r\nUsername: bob\r\nSecret: x\r\n\r\n");
    }

    #[test]
    fn test_response_parsing_helpers() {
        let mut fields = HashMap::new();
        fields.insert("response".to_string(), "Success".to_string());
        fields.insert("message".to_string(), "ok".to_string());
        let response = ManagerResponse { fields };

        assert!(response.is_success());
        assert_eq!(response.message(), "ok");
        assert_eq!(response.get("response"), Some("Success"));
        assert_eq!(response.get("missing"), None);
    }
}
