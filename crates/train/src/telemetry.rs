//! Scalar telemetry sinks.
//!
//! The training loop calls [`TelemetrySink::update`] on the hot path, so a
//! sink never blocks: [`JsonlSink`] hands serialized records to a writer
//! thread through an unbounded channel.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use serde_json::{Map, Value};
use tracing::warn;

use moevar_common::Result;

pub trait TelemetrySink: Send {
    fn update(&mut self, step: usize, scalars: &[(&str, f64)]);

    fn flush(&mut self);

    /// Flush and release the sink. Later updates are dropped.
    fn close(&mut self);
}

/// Discards everything; used on non-master ranks.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn update(&mut self, _step: usize, _scalars: &[(&str, f64)]) {}

    fn flush(&mut self) {}

    fn close(&mut self) {}
}

enum Message {
    Record(String),
    Flush,
}

/// One JSON object per line: `{"step": n, "Lm": ..., ...}`.
pub struct JsonlSink {
    tx: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::channel::<Message>();
        let worker = std::thread::spawn(move || {
            let mut out = BufWriter::new(file);
            for msg in rx {
                let res = match msg {
                    Message::Record(line) => writeln!(out, "{line}"),
                    Message::Flush => out.flush(),
                };
                if let Err(e) = res {
                    warn!("telemetry write failed: {e}");
                }
            }
            if let Err(e) = out.flush() {
                warn!("telemetry flush failed: {e}");
            }
        });
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn send(&mut self, msg: Message) {
        let Some(tx) = &self.tx else { return };
        if tx.send(msg).is_err() {
            warn!("telemetry writer exited; disabling sink");
            self.tx = None;
        }
    }
}

impl TelemetrySink for JsonlSink {
    fn update(&mut self, step: usize, scalars: &[(&str, f64)]) {
        let mut record = Map::new();
        record.insert("step".into(), Value::from(step));
        for (name, value) in scalars {
            // NaN and infinities have no JSON form.
            let v = serde_json::Number::from_f64(*value).map_or(Value::Null, Value::Number);
            record.insert((*name).to_string(), v);
        }
        self.send(Message::Record(Value::Object(record).to_string()));
    }

    fn flush(&mut self) {
        self.send(Message::Flush);
    }

    fn close(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("telemetry writer panicked");
            }
        }
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_writes_every_record_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tb").join("scalars.jsonl");
        let mut sink = JsonlSink::create(&path).unwrap();
        for step in 0..50 {
            sink.update(step, &[("Lm", step as f64 * 0.5), ("tnm", f64::NAN)]);
        }
        sink.flush();
        sink.close();
        sink.update(99, &[("Lm", 1.0)]);

        let text = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(rows.len(), 50);
        assert_eq!(rows[10]["step"], 10);
        assert_eq!(rows[10]["Lm"], 5.0);
        assert!(rows[10]["tnm"].is_null());
    }

    #[test]
    fn null_sink_accepts_anything() {
        let mut sink: Box<dyn TelemetrySink> = Box::new(NullSink);
        sink.update(0, &[("x", 1.0)]);
        sink.flush();
        sink.close();
    }
}
