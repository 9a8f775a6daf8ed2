//! Marker scanning: pulling a synchronous reply out of the server's
//! otherwise unstructured stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::router::{Flow, StdoutConsumer};

/// A command whose reply is recognised by a marker in stdout.
#[derive(Clone)]
pub struct StdoutQuery {
    /// Line written to stdin.
    pub command: String,
    /// Text that precedes the reply field.
    pub marker: String,
    /// Maximum width of the reply field.
    pub width: usize,
    /// Whether a candidate field is really the reply.
    pub accept: fn(&str) -> bool,
}

impl StdoutQuery {
    pub fn new(command: &str, marker: &str, width: usize) -> Self {
        Self {
            command: command.to_string(),
            marker: marker.to_string(),
            width,
            accept: |_| true,
        }
    }

    /// CasparCG replies to `VERSION` with `201 VERSION OK` followed by the
    /// version string, on the same line or the next one.
    pub fn version() -> Self {
        Self {
            accept: looks_like_version,
            ..Self::new("VERSION", "VERSION OK", 8)
        }
    }
}

fn looks_like_version(field: &str) -> bool {
    field.starts_with(|c: char| c.is_ascii_digit())
}

/// 마커 뒤의 필드를 꺼낸다. 앞쪽 공백은 건너뛰고, 최대 `width` 글자,
/// 첫 공백에서 자른다. 필드가 아직 도착하지 않았으면 `None`.
pub fn extract_field(text: &str, marker: &str, width: usize) -> Option<String> {
    let start = text.find(marker)? + marker.len();
    leading_field(&text[start..], width)
}

fn leading_field(text: &str, width: usize) -> Option<String> {
    let field: String = text
        .trim_start()
        .chars()
        .take(width)
        .take_while(|c| !c.is_whitespace())
        .collect();
    if field.is_empty() {
        None
    } else {
        Some(field)
    }
}

/// Builds the scanning consumer for `query`.
///
/// The field is read from the marker line itself or, when the marker line
/// ends without one, from the first following line that `query.accept`
/// takes. It goes out through `reply` exactly once and the consumer asks to
/// be released. Every other line is passed on to `passthrough`.
pub fn marker_scanner(
    query: &StdoutQuery,
    reply: oneshot::Sender<String>,
    passthrough: StdoutConsumer,
) -> StdoutConsumer {
    let marker = query.marker.clone();
    let width = query.width;
    let accept = query.accept;
    let reply = Mutex::new(Some(reply));
    let marker_seen = AtomicBool::new(false);

    Arc::new(move |chunk: &str| {
        let candidate = if chunk.contains(marker.as_str()) {
            marker_seen.store(true, Ordering::SeqCst);
            extract_field(chunk, &marker, width)
        } else if marker_seen.load(Ordering::SeqCst) {
            leading_field(chunk, width)
        } else {
            None
        };

        match candidate.filter(|field| accept(field)) {
            Some(field) => {
                if let Some(tx) = reply.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(field);
                }
                Flow::Release
            }
            None => {
                // 마커 줄은 삼키고, 응답과 무관한 줄은 로그로 흘려보낸다
                if !chunk.contains(marker.as_str()) {
                    passthrough(chunk);
                }
                Flow::Continue
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::router::StdoutRouter;

    #[test]
    fn test_extract_field_same_line() {
        assert_eq!(
            extract_field("...#201 VERSION OK 2.3.0 ...", "VERSION OK", 8),
            Some("2.3.0".to_string())
        );
    }

    #[test]
    fn test_extract_field_is_fixed_width() {
        assert_eq!(
            extract_field("201 VERSION OK\n2.3.0.1234 Stable\n", "VERSION OK", 8),
            Some("2.3.0.12".to_string())
        );
    }

    #[test]
    fn test_extract_field_missing() {
        assert_eq!(extract_field("201 VERSION OK\n", "VERSION OK", 8), None);
        assert_eq!(extract_field("[info] channel 1 ready", "VERSION OK", 8), None);
    }

    fn logging_router() -> (Arc<Mutex<Vec<String>>>, Arc<StdoutRouter>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let default: StdoutConsumer = Arc::new(move |chunk: &str| {
            sink.lock().unwrap().push(chunk.to_string());
            Flow::Continue
        });
        (log, Arc::new(StdoutRouter::new(default)))
    }

    #[tokio::test]
    async fn test_version_scanner_restores_default_consumer() {
        let (log, router) = logging_router();
        let (tx, rx) = oneshot::channel();
        router.set_consumer(marker_scanner(&StdoutQuery::version(), tx, router.default_consumer()));

        router.dispatch("[info] mixer ready");
        router.dispatch("...#201 VERSION OK 2.3.0 ...");
        assert_eq!(rx.await.unwrap(), "2.3.0");
        assert!(router.is_default());

        router.dispatch("after");
        let log = log.lock().unwrap();
        assert_eq!(log.as_slice(), ["[info] mixer ready", "after"]);
    }

    #[tokio::test]
    async fn test_version_scanner_across_lines() {
        let (log, router) = logging_router();
        let (tx, rx) = oneshot::channel();
        router.set_consumer(marker_scanner(&StdoutQuery::version(), tx, router.default_consumer()));

        router.dispatch("201 VERSION OK");
        assert!(!router.is_default());
        router.dispatch("2.3.0 Stable");
        assert_eq!(rx.await.unwrap(), "2.3.0");
        assert!(router.is_default());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_scanner_skips_log_line_after_bare_marker() {
        let (log, router) = logging_router();
        let (tx, rx) = oneshot::channel();
        router.set_consumer(marker_scanner(&StdoutQuery::version(), tx, router.default_consumer()));

        router.dispatch("201 VERSION OK");
        router.dispatch("[info] tick");
        assert!(!router.is_default());
        router.dispatch("2.3.0 Stable");
        assert_eq!(rx.await.unwrap(), "2.3.0");
        assert!(router.is_default());
        assert_eq!(log.lock().unwrap().as_slice(), ["[info] tick"]);
    }

    #[tokio::test]
    async fn test_custom_query_accepts_any_field() {
        let (_, router) = logging_router();
        let (tx, rx) = oneshot::channel();
        let query = StdoutQuery::new("INFO PATHS", "INFO PATHS OK", 16);
        router.set_consumer(marker_scanner(&query, tx, router.default_consumer()));

        router.dispatch("201 INFO PATHS OK");
        router.dispatch("<paths>");
        assert_eq!(rx.await.unwrap(), "<paths>");
    }

    #[test]
    fn test_scanner_delivers_once() {
        let (tx, mut rx) = oneshot::channel();
        let passthrough: StdoutConsumer = Arc::new(|_chunk: &str| Flow::Continue);
        let scanner = marker_scanner(&StdoutQuery::version(), tx, passthrough);

        assert_eq!(scanner("201 VERSION OK 2.3.0"), Flow::Release);
        // 같은 스캐너가 다시 불려도 첫 응답이 그대로 남는다
        assert_eq!(scanner("201 VERSION OK 9.9.9"), Flow::Release);
        assert_eq!(rx.try_recv().unwrap(), "2.3.0");
    }
}
