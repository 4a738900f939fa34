//! Per-endpoint REST admission control driven by response headers.

use crate::error::{Error, Result};
use crate::sync::CtxMutex;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Derive the admission-control bucket key for a REST endpoint path.
///
/// Strips the query string, then walks path segments: when the first segment
/// is `channels` or `guilds`, the first two segments (the "major parameter")
/// are preserved verbatim; every other odd-indexed segment that looks like
/// an ID (numeric, a Unicode emoji, or a `name:id` custom emoji) is replaced
/// with the empty string.
pub fn bucket_key(endpoint: &str) -> String {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    let mut segments: Vec<&str> = path.split('/').collect();
    if segments.first() == Some(&"") {
        segments.remove(0);
    }

    let preserve_major = matches!(segments.first(), Some(&"channels") | Some(&"guilds"));

    let out: Vec<String> = segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let is_major_param = i == 1 && preserve_major;
            if i % 2 == 1 && !is_major_param && is_replaceable_segment(seg) {
                String::new()
            } else {
                (*seg).to_string()
            }
        })
        .collect();

    format!("/{}", out.join("/"))
}

fn is_replaceable_segment(seg: &str) -> bool {
    if seg.is_empty() {
        return false;
    }
    seg.chars().all(|c| c.is_ascii_digit())
        || is_unicode_emoji(seg)
        || is_custom_emoji(seg)
}

fn is_unicode_emoji(seg: &str) -> bool {
    let chars: Vec<char> = seg.chars().collect();
    if chars.is_empty() || chars.len() > 2 {
        return false;
    }
    is_emoji_code_point(chars[0])
}

fn is_emoji_code_point(c: char) -> bool {
    let cp = c as u32;
    cp == 0x00A9 || cp == 0x00AE || (0x2000..=0x3300).contains(&cp) || (0x1F000..=0x1FFFF).contains(&cp)
}

fn is_custom_emoji(seg: &str) -> bool {
    match seg.split_once(':') {
        Some((name, id)) => {
            !name.is_empty()
                && !name.chars().any(|c| c.is_whitespace())
                && !id.is_empty()
                && id.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// A custom substring-matched interval policy for an endpoint bucket.
#[derive(Debug, Clone)]
pub struct CustomPolicy {
    pub matches_substring: String,
    pub interval: Duration,
}

struct BucketState {
    remaining: i64,
    limit: i64,
    reset: Option<i64>,
    last_reset: Option<i64>,
    custom: Option<CustomPolicy>,
}

/// A per-endpoint admission-control slot.
pub struct Bucket {
    lock: CtxMutex<()>,
    state: StdMutex<BucketState>,
}

impl Bucket {
    fn new(custom: Option<CustomPolicy>) -> Self {
        Bucket {
            lock: CtxMutex::new(()),
            state: StdMutex::new(BucketState {
                remaining: 1,
                limit: 0,
                reset: None,
                last_reset: None,
                custom,
            }),
        }
    }
}

/// Per-bucket and process-wide admission control for the REST API.
///
/// The bucket map uses at-most-one-construct semantics: concurrent callers
/// deriving the same new key race on a short-held `std::sync::Mutex`, so
/// exactly one `Bucket` is constructed per key.
pub struct RateLimiter {
    buckets: StdMutex<HashMap<String, Arc<Bucket>>>,
    global_until: AtomicI64,
    custom_policies: Vec<CustomPolicy>,
    extra_delay: Duration,
}

impl RateLimiter {
    pub fn new(extra_delay: Duration) -> Self {
        RateLimiter {
            buckets: StdMutex::new(HashMap::new()),
            global_until: AtomicI64::new(0),
            custom_policies: Vec::new(),
            extra_delay,
        }
    }

    /// Register a custom-interval policy applied to buckets whose endpoint
    /// contains `matches_substring`, in place of header-driven resets.
    pub fn with_custom_policy(mut self, policy: CustomPolicy) -> Self {
        self.custom_policies.push(policy);
        self
    }

    fn bucket_for(&self, endpoint: &str) -> Arc<Bucket> {
        let key = bucket_key(endpoint);
        let mut buckets = self.buckets.lock().expect("rate limiter bucket map poisoned");
        buckets
            .entry(key)
            .or_insert_with(|| {
                let custom = self
                    .custom_policies
                    .iter()
                    .find(|p| endpoint.contains(&p.matches_substring))
                    .cloned();
                Arc::new(Bucket::new(custom))
            })
            .clone()
    }

    /// Admission control before issuing a request against `endpoint`.
    pub async fn acquire(&self, endpoint: &str, token: &CancellationToken) -> Result<()> {
        let bucket = self.bucket_for(endpoint);
        let _guard = bucket.lock.lock(token).await?;

        let now = now_millis();
        let bucket_wait = {
            let state = bucket.state.lock().expect("bucket state poisoned");
            if state.remaining == 0 {
                state.reset.filter(|&r| r > now).map(|r| r - now)
            } else {
                None
            }
        };
        let sleep_ms = bucket_wait.or_else(|| {
            let global = self.global_until.load(Ordering::SeqCst);
            (global > now).then_some(global - now)
        });

        if let Some(ms) = sleep_ms {
            if ms > 0 {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {}
                }
            }
        }

        let mut state = bucket.state.lock().expect("bucket state poisoned");
        if state.remaining > 0 {
            state.remaining -= 1;
        }
        Ok(())
    }

    /// Apply response headers after a request against `endpoint` completes.
    /// Silently no-ops if no bucket was ever created for the endpoint.
    pub async fn release(&self, endpoint: &str, headers: &HeaderMap) -> Result<()> {
        let bucket = {
            let buckets = self.buckets.lock().expect("rate limiter bucket map poisoned");
            match buckets.get(&bucket_key(endpoint)) {
                Some(b) => b.clone(),
                None => return Ok(()),
            }
        };

        // Release isn't part of the caller-cancellable surface; it never
        // blocks for long, so a token that's never cancelled is appropriate.
        let local_token = CancellationToken::new();
        let _guard = bucket.lock.lock(&local_token).await?;

        let now = now_millis();
        let mut state = bucket.state.lock().expect("bucket state poisoned");

        if let Some(custom) = state.custom.clone() {
            let due = state
                .last_reset
                .map(|last| now - last >= custom.interval.as_millis() as i64)
                .unwrap_or(true);
            if due {
                state.last_reset = Some(now);
                state.reset = Some(now + custom.interval.as_millis() as i64);
            }
            return Ok(());
        }

        if let Some(retry_after) = read_header_f64(headers, "Retry-After")? {
            let at = now + (retry_after * 1000.0) as i64;
            if headers.get("X-RateLimit-Global").is_some() {
                self.global_until.store(at, Ordering::SeqCst);
            } else {
                state.reset = Some(at);
            }
        } else if let Some(reset_at) = read_header_f64(headers, "X-RateLimit-Reset")? {
            let at = (reset_at * 1000.0) as i64 + self.extra_delay.as_millis() as i64;
            state.reset = Some(at);
        }

        if let Some(remaining) = read_header_f64(headers, "X-RateLimit-Remaining")? {
            state.remaining = remaining as i64;
        }
        if let Some(limit) = read_header_f64(headers, "X-RateLimit-Limit")? {
            state.limit = limit as i64;
        }

        Ok(())
    }
}

fn read_header_f64(headers: &HeaderMap, name: &str) -> Result<Option<f64>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|_| Error::RateLimitParseError(format!("{name} header is not UTF-8")))?;
            text.parse::<f64>()
                .map(Some)
                .map_err(|e| Error::RateLimitParseError(format!("{name}: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn bucket_key_preserves_major_parameter_and_strips_ids() {
        assert_eq!(
            bucket_key("/channels/1/messages/1/reactions/\u{1F914}/@me"),
            "/channels/1/messages//reactions//@me"
        );
        assert_eq!(
            bucket_key("/channels/486833611564253186/messages/540519319814275089/reactions/\u{1F97A}/@me"),
            "/channels/486833611564253186/messages//reactions//@me"
        );
        assert_eq!(bucket_key("/guilds/123123/messages"), "/guilds/123123/messages");
        assert_eq!(bucket_key("/channels/123123/message/123456"), "/channels/123123/message/");
    }

    #[test]
    fn bucket_key_matches_existing_double_slash_behavior() {
        assert_eq!(bucket_key("/user/123123/"), "/user//");
    }

    #[test]
    fn bucket_key_is_idempotent() {
        let once = bucket_key("/channels/1/messages/1/reactions/\u{1F914}/@me");
        let twice = bucket_key(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn custom_emoji_detector_boundary_cases() {
        assert!(is_custom_emoji("StareNeutral:612368399732965376"));
        assert!(!is_custom_emoji("has space:1"));
        assert!(!is_custom_emoji("no_id:abc"));
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[tokio::test]
    async fn per_bucket_throttling_sleeps_for_reset_window() {
        let limiter = RateLimiter::new(Duration::from_millis(250));
        let token = CancellationToken::new();
        let endpoint = "/guilds/99/channels";

        limiter.acquire(endpoint, &token).await.unwrap();
        let reset = chrono::Utc::now().timestamp_millis() + 2000;
        let hdrs = headers(&[
            ("X-RateLimit-Remaining", "0"),
            ("X-RateLimit-Reset", &format!("{:.3}", reset as f64 / 1000.0)),
        ]);
        limiter.release(endpoint, &hdrs).await.unwrap();

        let start = std::time::Instant::now();
        limiter.acquire(endpoint, &token).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn global_cooldown_blocks_other_endpoints() {
        let limiter = RateLimiter::new(Duration::from_millis(0));
        let token = CancellationToken::new();

        limiter.acquire("/channels/1/messages", &token).await.unwrap();
        let hdrs = headers(&[("X-RateLimit-Global", "1.002"), ("Retry-After", "1")]);
        limiter.release("/channels/1/messages", &hdrs).await.unwrap();

        let start = std::time::Instant::now();
        limiter.acquire("/guilds/2/members", &token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
