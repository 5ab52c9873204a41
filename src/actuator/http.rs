use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};

use super::{validate_intensity, Actuator, Credentials, TransportError};

/// Dimmer driven by `GET {endpoint}?m=1&d0={intensity}` with basic auth.
pub struct HttpDimmer {
    client: Client,
    endpoint: Url,
    credentials: Option<Credentials>,
}

impl HttpDimmer {
    pub fn new(
        endpoint: Url,
        credentials: Option<Credentials>,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            credentials,
        })
    }

    fn request_url(&self, level: u8) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("m", "1")
            .append_pair("d0", &level.to_string());
        url
    }
}

impl Actuator for HttpDimmer {
    fn send(&mut self, intensity: i32) -> Result<(), TransportError> {
        let level = validate_intensity(intensity)?;

        let mut request = self.client.get(self.request_url(level));
        if let Some(ref creds) = self.credentials {
            request = request.basic_auth(&creds.username, creds.password.as_ref());
        }

        let response = request.send()?;
        if response.status() != StatusCode::OK {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        log::debug!("Dimmer -> {}%", level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Accept one request, answer with `status`, and return the raw request head.
    fn one_shot_server(status: &'static str) -> (Url, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let reply = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
            stream.write_all(reply.as_bytes()).unwrap();
            String::from_utf8_lossy(&head).into_owned()
        });
        (url, handle)
    }

    fn credentials() -> Option<Credentials> {
        Some(Credentials {
            username: "admin".into(),
            password: Some("secret".into()),
        })
    }

    #[test]
    fn sends_intensity_with_basic_auth() {
        let (url, server) = one_shot_server("200 OK");
        let mut dimmer = HttpDimmer::new(url, credentials(), Some(Duration::from_secs(10))).unwrap();
        dimmer.send(72).unwrap();

        let head = server.join().unwrap();
        assert!(head.starts_with("GET /?m=1&d0=72 HTTP/1.1\r\n"), "{}", head);
        assert!(head
            .to_ascii_lowercase()
            .contains("authorization: basic ywrtaw46c2vjcmv0"));
    }

    #[test]
    fn non_200_is_a_transport_error() {
        let (url, server) = one_shot_server("401 Unauthorized");
        let mut dimmer = HttpDimmer::new(url, None, Some(Duration::from_secs(10))).unwrap();
        let err = dimmer.send(10).unwrap_err();
        assert!(matches!(err, TransportError::Status(401)));
        assert!(err.is_retryable());
        server.join().unwrap();
    }

    #[test]
    fn out_of_range_never_touches_the_network() {
        // Nothing listens here; an attempted request would fail differently.
        let url = Url::parse("http://127.0.0.1:9").unwrap();
        let mut dimmer = HttpDimmer::new(url, credentials(), Some(Duration::from_millis(200))).unwrap();
        assert!(matches!(dimmer.send(-1), Err(TransportError::InvalidIntensity(-1))));
        assert!(matches!(dimmer.send(101), Err(TransportError::InvalidIntensity(101))));
    }

    #[test]
    fn boundary_values_are_accepted() {
        for level in [0, 100] {
            let (url, server) = one_shot_server("200 OK");
            let mut dimmer = HttpDimmer::new(url, None, Some(Duration::from_secs(10))).unwrap();
            dimmer.send(level).unwrap();
            assert!(server.join().unwrap().contains(&format!("d0={} ", level)));
        }
    }
}
