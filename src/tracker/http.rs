use std::time::Duration;

use reqwest::Client;

use super::error::TrackerError;
use super::response::{parse_compact_peers, parse_compact_peers6, AnnounceResponse};
use super::AnnounceRequest;
use crate::bencode::{decode, Value};
use crate::constants::HTTP_TRACKER_TIMEOUT;

/// An HTTP(S) tracker client.
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }
        let client = Client::builder()
            .timeout(HTTP_TRACKER_TIMEOUT)
            .user_agent(crate::constants::CLIENT_VERSION)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&key={}&numwant={}",
            self.url,
            req.info_hash.url_encode(),
            url_encode(&req.peer_id),
            req.port,
            req.uploaded,
            req.downloaded,
            req.left,
            req.key,
            req.num_want,
        );
        let event = req.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        let body = self.client.get(&url).send().await?.bytes().await?;
        parse_announce_body(&body)
    }
}

fn parse_announce_body(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let root = decode(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict"));
    }

    if let Some(reason) = root.get_str(b"failure reason") {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = root
        .get_int(b"interval")
        .filter(|&i| i > 0)
        .ok_or(TrackerError::InvalidResponse("missing interval"))?;

    let mut response = AnnounceResponse::new(Duration::from_secs(interval as u64));
    response.min_interval = root
        .get_int(b"min interval")
        .filter(|&i| i > 0)
        .map(|i| Duration::from_secs(i as u64));
    response.complete = root.get_int(b"complete").map(|c| c as u32);
    response.incomplete = root.get_int(b"incomplete").map(|c| c as u32);
    response.warning = root.get_str(b"warning message").map(String::from);

    match root.get(b"peers") {
        // compact: packed 6-byte entries
        Some(Value::Str(packed)) => {
            response.peers = parse_compact_peers(packed);
        }
        // non-compact: list of dicts with "ip" and "port"
        Some(Value::List(list)) => {
            for entry in list {
                let ip = entry.get_str(b"ip").and_then(|s| s.parse().ok());
                let port = entry
                    .get_int(b"port")
                    .filter(|&p| (1..=u16::MAX as i64).contains(&p));
                if let (Some(ip), Some(port)) = (ip, port) {
                    response
                        .peers
                        .push(std::net::SocketAddr::new(ip, port as u16));
                }
            }
        }
        _ => {}
    }

    if let Some(packed6) = root.get_bytes(b"peers6") {
        response.peers.extend(parse_compact_peers6(packed6));
    }

    Ok(response)
}

fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                (b as char).to_string()
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}

#[cfg(test)]
pub(super) fn parse_announce_body_for_tests(
    body: &[u8],
) -> Result<AnnounceResponse, TrackerError> {
    parse_announce_body(body)
}
