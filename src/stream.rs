use std::fmt::Display;
use std::time::Duration;

use async_stream::stream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
  Fragment(String),
  /// The backend connection broke after streaming had begun.
  Failed(String),
}

/// Longest NDJSON line kept in memory; longer lines are skipped.
pub const MAX_LINE_BYTES: usize = 1 << 20;

struct ParsedLine {
  fragment: Option<String>,
  done: bool,
}

/// Decodes a newline-delimited JSON body into text fragments.
///
/// Lines that are blank or not JSON are skipped. Decoding stops at the first
/// object with a truthy `done`, after which the source is never polled again.
/// `idle_timeout` bounds each wait for the next chunk.
pub fn fragments<S, B, E>(source: S, idle_timeout: Duration) -> impl Stream<Item = StreamItem>
where
  S: Stream<Item = Result<B, E>> + Send + 'static,
  B: AsRef<[u8]> + Send,
  E: Display + Send,
{
  stream! {
    let mut source = Box::pin(source);
    let mut buffer: Vec<u8> = Vec::new();
    // bytes of `buffer` already searched for a newline
    let mut scanned = 0;
    // inside an oversized line whose head was dropped
    let mut discarding = false;

    loop {
      let next = match tokio::time::timeout(idle_timeout, source.next()).await {
        Ok(next) => next,
        Err(_) => {
          warn!("backend stream idle for {:?}, giving up", idle_timeout);
          yield StreamItem::Failed("LLM server stream timed out".to_string());
          return;
        }
      };

      let chunk = match next {
        Some(Ok(chunk)) => chunk,
        Some(Err(err)) => {
          warn!(error = %err, "backend stream broke");
          yield StreamItem::Failed(err.to_string());
          return;
        }
        None => break,
      };

      buffer.extend_from_slice(chunk.as_ref());
      let mut start = 0;
      loop {
        let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') else {
          break;
        };
        let end = scanned + offset;
        let parsed = if discarding { None } else { parse_line(&buffer[start..end]) };
        discarding = false;
        start = end + 1;
        scanned = start;

        if let Some(parsed) = parsed {
          if let Some(fragment) = parsed.fragment {
            yield StreamItem::Fragment(fragment);
          }
          if parsed.done {
            debug!("backend signalled done");
            return;
          }
        }
      }
      buffer.drain(..start);
      scanned = buffer.len();

      if buffer.len() > MAX_LINE_BYTES {
        warn!(len = buffer.len(), "dropping oversized stream line");
        buffer.clear();
        scanned = 0;
        discarding = true;
      }
    }

    // last line may come without a trailing newline
    if let Some(parsed) = parse_line(&buffer).filter(|_| !discarding) {
      if let Some(fragment) = parsed.fragment {
        yield StreamItem::Fragment(fragment);
      }
    }
  }
}

fn parse_line(line: &[u8]) -> Option<ParsedLine> {
  let line = line.trim_ascii();
  if line.is_empty() {
    return None;
  }
  let value: serde_json::Value = match serde_json::from_slice(line) {
    Ok(v) => v,
    Err(_) => {
      debug!("skipping malformed stream line");
      return None;
    }
  };
  Some(ParsedLine {
    fragment: value["response"]
      .as_str()
      .filter(|s| !s.is_empty())
      .map(str::to_string),
    done: is_truthy(&value["done"]),
  })
}

pub(crate) fn is_truthy(value: &serde_json::Value) -> bool {
  match value {
    serde_json::Value::Null => false,
    serde_json::Value::Bool(b) => *b,
    serde_json::Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
    serde_json::Value::String(s) => !s.is_empty(),
    serde_json::Value::Array(a) => !a.is_empty(),
    serde_json::Value::Object(o) => !o.is_empty(),
  }
}
