//! Follow a deployment's progress stream.

use futures::StreamExt;
use stratus_control::tracker::DeploymentSnapshot;
use thiserror::Error;

use super::client::{ClientError, ControlClient};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("stream interrupted: {0}")]
    Stream(#[from] reqwest::Error),

    #[error("server reported: {0}")]
    Server(String),

    #[error("stream ended before the deployment finished")]
    Truncated,
}

/// One parsed server-sent event.
#[derive(Debug, Default, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
    current: SseEvent,
}

impl SseParser {
    fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.current.data.is_empty() || !self.current.event.is_empty() {
                    events.push(std::mem::take(&mut self.current));
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.current.event = value.trim_start().to_owned();
            } else if let Some(value) = line.strip_prefix("data:") {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value.trim_start());
            }
        }
        events
    }
}

/// Print snapshots until the deployment finishes. Returns the final status.
pub async fn run(client: &ControlClient, id: &str) -> Result<String, WatchError> {
    let response = client.stream(&format!("/deployments/{id}/stream")).await?;
    let mut body = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for event in parser.push(&String::from_utf8_lossy(&chunk)) {
            match event.event.as_str() {
                "progress" | "complete" => {
                    let Ok(snapshot) = serde_json::from_str::<DeploymentSnapshot>(&event.data)
                    else {
                        continue;
                    };
                    print_snapshot(&snapshot);
                    if event.event == "complete" {
                        return Ok(snapshot.status.to_string());
                    }
                }
                "error" => {
                    let message = serde_json::from_str::<serde_json::Value>(&event.data)
                        .ok()
                        .and_then(|v| v["error"].as_str().map(str::to_owned))
                        .unwrap_or(event.data);
                    return Err(WatchError::Server(message));
                }
                _ => {}
            }
        }
    }
    Err(WatchError::Truncated)
}

fn print_snapshot(snapshot: &DeploymentSnapshot) {
    let step = snapshot
        .current_step
        .map_or_else(String::new, |s| format!(" [{s}]"));
    println!("{:>3}% {}{}", snapshot.progress, snapshot.status, step);
    for task in &snapshot.tasks {
        let step = task
            .current_step
            .map_or_else(String::new, |s| format!(" {s}"));
        println!(
            "      {:<16} {:>3}% {}{}",
            task.node_name, task.progress, task.status, step
        );
    }
    if let Some(error) = &snapshot.error {
        println!("      error: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push("event: progress\nda").is_empty());
        let events = parser.push("ta: {\"a\":1}\n\nevent: complete\ndata: {}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "progress".to_owned(),
                    data: "{\"a\":1}".to_owned(),
                },
                SseEvent {
                    event: "complete".to_owned(),
                    data: "{}".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn keep_alive_comments_are_ignored() {
        let mut parser = SseParser::default();
        assert!(parser.push(":\n\n").is_empty());
    }
}
