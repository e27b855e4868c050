use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use ipnet::IpNet;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_requests: u64,
    window: Duration,
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Option<Self> {
        if max_requests == 0 || window.is_zero() {
            return None;
        }
        Some(Self {
            max_requests,
            window,
            windows: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut windows = self.windows.lock().await;
        Self::evict_expired(&mut windows, self.window, now);

        let window = windows.entry(ip).or_insert(Window {
            started_at: now,
            count: 0,
        });
        window.count += 1;
        window.count <= self.max_requests
    }

    fn evict_expired(windows: &mut HashMap<IpAddr, Window>, window: Duration, now: Instant) {
        windows.retain(|_, w| now.duration_since(w.started_at) < window);
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.windows.lock().await.len()
    }
}

fn parse_leftmost_x_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    if let Ok(ip) = first.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = first.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    None
}

fn is_trusted_proxy(peer_ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&peer_ip))
}

/// Peer address, or the leftmost `X-Forwarded-For` entry when the peer is a
/// trusted proxy.
pub fn client_ip(
    trust_proxy_headers: bool,
    trusted_proxy_cidrs: &[IpNet],
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Option<IpAddr> {
    let peer_ip = peer?.ip();

    if !trust_proxy_headers || !is_trusted_proxy(peer_ip, trusted_proxy_cidrs) {
        return Some(peer_ip);
    }

    Some(parse_leftmost_x_forwarded_for(headers).unwrap_or(peer_ip))
}
