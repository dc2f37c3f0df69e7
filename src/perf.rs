//! Optional CSV performance reporting.
//!
//! When enabled, one row is written per finalized update (or batch of
//! merged updates) with the timing marks collected along the pipeline.
//! Multi-valued fields are colon-separated microseconds-since-epoch
//! integers.

use std::io::{self, Write};

use crate::update::Update;

const HEADER: &str = "id,mode,immediate,width,height,enqueue_times,dequeue_times,\
                      generate_start_times,generate_end_times,vsync_start_times,vsync_end_times\n";

/// CSV sink for per-update timing rows.
pub struct PerfReport {
    sink: Box<dyn Write + Send>,
}

impl PerfReport {
    /// Wrap a sink, writing the CSV header immediately.
    pub fn new(mut sink: Box<dyn Write + Send>) -> io::Result<Self> {
        sink.write_all(HEADER.as_bytes())?;
        Ok(Self { sink })
    }

    /// Write the row for one finalized update.
    pub fn record(&mut self, update: &Update) -> io::Result<()> {
        let timing = &update.timing;
        writeln!(
            self.sink,
            "{},{},{},{},{},{},{},{},{},{},{}",
            join(&update.ids),
            update.mode,
            update.immediate,
            update.region.width,
            update.region.height,
            join(&timing.enqueue),
            join(&timing.dequeue),
            join(&timing.generate_start),
            join(&timing.generate_end),
            join(&timing.vsync_start),
            join(&timing.vsync_end),
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Region;

    #[test]
    fn rows_join_multi_valued_fields_with_colons() {
        let buffer: Vec<u8> = Vec::new();
        let shared = std::sync::Arc::new(std::sync::Mutex::new(buffer));

        struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

        impl Write for SharedSink {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut report = PerfReport::new(Box::new(SharedSink(shared.clone()))).unwrap();

        let mut update = Update::new(4, 2, true, Region::new(0, 0, 8, 4), vec![0; 32]);
        update.ids.push(5);
        update.timing.enqueue = vec![100, 150];
        update.timing.dequeue = vec![200, 210];
        update.timing.generate_start = vec![300];
        update.timing.generate_end = vec![310];
        update.timing.vsync_start = vec![400];
        update.timing.vsync_end = vec![410];
        report.record(&update).unwrap();

        let output = String::from_utf8(shared.lock().unwrap().clone()).unwrap();
        let mut lines = output.lines();
        assert!(lines.next().unwrap().starts_with("id,mode,immediate"));
        assert_eq!(
            lines.next().unwrap(),
            "4:5,2,true,8,4,100:150,200:210,300,310,400,410"
        );
    }
}
