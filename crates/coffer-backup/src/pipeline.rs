//! Multi-stage work pipeline. A work item flows through an ordered chain of
//! stages; each stage advertises an admission predicate and may pair with
//! the stage after it through a unidirectional byte pipe of length-delimited
//! frames. Failures never cross a stage boundary: a stage returns the item
//! with its error chain extended, and a failed item completes early.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};

use crate::error::{BackupError, Result};

/// Frames carried by the inter-stage byte pipe. `DataFinal` is EOF after
/// its enclosed bytes.
#[derive(Debug)]
pub enum PipeFrame {
    Data(Bytes),
    DataFinal(Bytes),
}

/// Number of frames buffered between paired stages.
const PIPE_FRAME_CAPACITY: usize = 4;

/// Writing end of an inter-stage byte pipe.
pub struct PipeWriter {
    tx: mpsc::Sender<PipeFrame>,
    eof_sent: bool,
}

impl PipeWriter {
    /// Send a data frame. Zero-byte writes are a no-op.
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        if self.eof_sent {
            return Err(BackupError::Pipeline("write after final frame".to_string()));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(PipeFrame::Data(data))
            .await
            .map_err(|_| BackupError::PipeConnectionEof)
    }

    /// Send the final frame; the payload may be empty.
    pub async fn write_final(&mut self, data: Bytes) -> Result<()> {
        if self.eof_sent {
            return Err(BackupError::Pipeline("final frame already sent".to_string()));
        }
        self.eof_sent = true;
        self.tx
            .send(PipeFrame::DataFinal(data))
            .await
            .map_err(|_| BackupError::PipeConnectionEof)
    }

    /// Blocking variant of [`PipeWriter::write`] for blocking-hosted stages.
    pub fn blocking_write(&mut self, data: Bytes) -> Result<()> {
        if self.eof_sent {
            return Err(BackupError::Pipeline("write after final frame".to_string()));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .blocking_send(PipeFrame::Data(data))
            .map_err(|_| BackupError::PipeConnectionEof)
    }

    /// Blocking variant of [`PipeWriter::write_final`].
    pub fn blocking_write_final(&mut self, data: Bytes) -> Result<()> {
        if self.eof_sent {
            return Err(BackupError::Pipeline("final frame already sent".to_string()));
        }
        self.eof_sent = true;
        self.tx
            .blocking_send(PipeFrame::DataFinal(data))
            .map_err(|_| BackupError::PipeConnectionEof)
    }
}

/// Reading end of an inter-stage byte pipe.
pub struct PipeReader {
    rx: mpsc::Receiver<PipeFrame>,
    eof: bool,
}

impl PipeReader {
    /// Receive the next frame's bytes. Returns empty bytes at and after EOF.
    ///
    /// A writer that goes away without sending a final frame is an error,
    /// not an EOF.
    pub async fn read(&mut self) -> Result<Bytes> {
        if self.eof {
            return Ok(Bytes::new());
        }
        match self.rx.recv().await {
            Some(PipeFrame::Data(data)) => Ok(data),
            Some(PipeFrame::DataFinal(data)) => {
                self.eof = true;
                Ok(data)
            }
            None => Err(BackupError::PipeConnectionEof),
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

/// Create a connected writer/reader pair.
pub fn byte_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_FRAME_CAPACITY);
    (
        PipeWriter { tx, eof_sent: false },
        PipeReader { rx, eof: false },
    )
}

/// A value-type work item moving through the pipeline.
///
/// Items are cloned when a stage pair runs both sides at once; `absorb`
/// merges the producer side's state back afterwards.
pub trait PipelineItem: Clone + Send + 'static {
    fn record_error(&mut self, error: BackupError);
    fn is_failed(&self) -> bool;
    fn absorb(&mut self, producer: Self);
}

/// The pipe end handed to a paired stage.
pub enum StagePipe {
    Writer(PipeWriter),
    Reader(PipeReader),
}

/// One stage of the pipeline.
#[async_trait]
pub trait PipelineStage<W: PipelineItem>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this stage wants the item. A declined item advances to the
    /// next stage.
    fn is_for_stage(&self, item: &W) -> bool;

    /// When true, this stage runs together with the immediately following
    /// stage, connected by a byte pipe.
    fn pipes_with_next(&self) -> bool {
        false
    }

    /// Perform the stage's work. Errors are recorded on the item, never
    /// returned.
    async fn run(&self, item: W, pipe: Option<StagePipe>) -> W;
}

/// Bounded, ordered multi-stage pipeline.
pub struct WorkPipeline<W: PipelineItem> {
    stages: Arc<Vec<Arc<dyn PipelineStage<W>>>>,
    limit: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl<W: PipelineItem> WorkPipeline<W> {
    /// Create a pipeline with the given stages and an in-flight bound.
    pub fn new(stages: Vec<Arc<dyn PipelineStage<W>>>, max_simultaneous_work_items: usize) -> Self {
        Self {
            stages: Arc::new(stages),
            limit: Arc::new(Semaphore::new(max_simultaneous_work_items.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Submit a work item. The returned channel yields the item after its
    /// final stage (or its early completion on failure).
    pub fn submit(&self, item: W) -> oneshot::Receiver<W> {
        let (done_tx, done_rx) = oneshot::channel();
        let stages = Arc::clone(&self.stages);
        let limit = Arc::clone(&self.limit);
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let _permit = Arc::clone(&limit).acquire_owned().await.ok();
            let mut item = item;
            let mut idx = 0usize;
            while idx < stages.len() && !item.is_failed() {
                let stage = Arc::clone(&stages[idx]);
                if !stage.is_for_stage(&item) {
                    idx += 1;
                    continue;
                }
                if stage.pipes_with_next() {
                    if idx + 1 >= stages.len() {
                        item.record_error(BackupError::Pipeline(
                            "last stage cannot pipe, there is no next stage".to_string(),
                        ));
                        break;
                    }
                    let consumer = Arc::clone(&stages[idx + 1]);
                    if !consumer.is_for_stage(&item) {
                        idx += 2;
                        continue;
                    }
                    let (writer, reader) = byte_pipe();
                    let producer_item = item.clone();
                    let (producer_out, consumer_out) = tokio::join!(
                        stage.run(producer_item, Some(StagePipe::Writer(writer))),
                        consumer.run(item, Some(StagePipe::Reader(reader))),
                    );
                    item = consumer_out;
                    item.absorb(producer_out);
                    idx += 2;
                } else {
                    item = stage.run(item, None).await;
                    idx += 1;
                }
            }
            let _ = done_tx.send(item);
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
        done_rx
    }

    /// Wait until every submitted item has completed.
    pub async fn drain(&self) {
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct TestItem {
        trail: Vec<&'static str>,
        payload: Vec<u8>,
        received: Vec<u8>,
        errors: Vec<String>,
        skip_middle: bool,
    }

    impl PipelineItem for TestItem {
        fn record_error(&mut self, error: BackupError) {
            self.errors.push(error.to_string());
        }

        fn is_failed(&self) -> bool {
            !self.errors.is_empty()
        }

        fn absorb(&mut self, producer: Self) {
            self.errors.extend(producer.errors);
            for marker in producer.trail {
                if !self.trail.contains(&marker) {
                    self.trail.push(marker);
                }
            }
        }
    }

    struct MarkStage {
        marker: &'static str,
        skippable: bool,
        fail: bool,
    }

    #[async_trait]
    impl PipelineStage<TestItem> for MarkStage {
        fn name(&self) -> &'static str {
            self.marker
        }

        fn is_for_stage(&self, item: &TestItem) -> bool {
            !(self.skippable && item.skip_middle)
        }

        async fn run(&self, mut item: TestItem, _pipe: Option<StagePipe>) -> TestItem {
            item.trail.push(self.marker);
            if self.fail {
                item.record_error(BackupError::Pipeline("boom".to_string()));
            }
            item
        }
    }

    struct SendStage;

    #[async_trait]
    impl PipelineStage<TestItem> for SendStage {
        fn name(&self) -> &'static str {
            "send"
        }

        fn is_for_stage(&self, _item: &TestItem) -> bool {
            true
        }

        fn pipes_with_next(&self) -> bool {
            true
        }

        async fn run(&self, mut item: TestItem, pipe: Option<StagePipe>) -> TestItem {
            item.trail.push("send");
            let Some(StagePipe::Writer(mut writer)) = pipe else {
                item.record_error(BackupError::Pipeline("missing writer".to_string()));
                return item;
            };
            for piece in item.payload.clone().chunks(3) {
                if let Err(e) = writer.write(Bytes::copy_from_slice(piece)).await {
                    item.record_error(e);
                    return item;
                }
            }
            if let Err(e) = writer.write_final(Bytes::new()).await {
                item.record_error(e);
            }
            item
        }
    }

    struct RecvStage;

    #[async_trait]
    impl PipelineStage<TestItem> for RecvStage {
        fn name(&self) -> &'static str {
            "recv"
        }

        fn is_for_stage(&self, _item: &TestItem) -> bool {
            true
        }

        async fn run(&self, mut item: TestItem, pipe: Option<StagePipe>) -> TestItem {
            item.trail.push("recv");
            let Some(StagePipe::Reader(mut reader)) = pipe else {
                item.record_error(BackupError::Pipeline("missing reader".to_string()));
                return item;
            };
            loop {
                match reader.read().await {
                    Ok(data) if data.is_empty() => break,
                    Ok(data) => item.received.extend_from_slice(&data),
                    Err(e) => {
                        item.record_error(e);
                        break;
                    }
                }
            }
            item
        }
    }

    fn stages(fail_middle: bool) -> Vec<Arc<dyn PipelineStage<TestItem>>> {
        vec![
            Arc::new(MarkStage { marker: "s1", skippable: false, fail: false }),
            Arc::new(MarkStage { marker: "s2", skippable: true, fail: fail_middle }),
            Arc::new(MarkStage { marker: "s3", skippable: false, fail: false }),
        ]
    }

    #[tokio::test]
    async fn items_run_stages_in_order() {
        let pipeline = WorkPipeline::new(stages(false), 4);
        let item = pipeline.submit(TestItem::default()).await.unwrap();
        assert_eq!(item.trail, vec!["s1", "s2", "s3"]);
        pipeline.drain().await;
    }

    #[tokio::test]
    async fn declined_items_advance_past_a_stage() {
        let pipeline = WorkPipeline::new(stages(false), 4);
        let item = pipeline
            .submit(TestItem { skip_middle: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(item.trail, vec!["s1", "s3"]);
    }

    #[tokio::test]
    async fn failed_items_complete_early_with_error_chain() {
        let pipeline = WorkPipeline::new(stages(true), 4);
        let item = pipeline.submit(TestItem::default()).await.unwrap();
        assert_eq!(item.trail, vec!["s1", "s2"]);
        assert_eq!(item.errors.len(), 1);
    }

    #[tokio::test]
    async fn paired_stages_stream_bytes_through_the_pipe() {
        let stages: Vec<Arc<dyn PipelineStage<TestItem>>> =
            vec![Arc::new(SendStage), Arc::new(RecvStage)];
        let pipeline = WorkPipeline::new(stages, 2);
        let payload: Vec<u8> = (0..100u8).collect();
        let item = pipeline
            .submit(TestItem { payload: payload.clone(), ..Default::default() })
            .await
            .unwrap();
        assert!(item.errors.is_empty(), "{:?}", item.errors);
        assert_eq!(item.received, payload);
        // Both halves ran, and the producer's trail was absorbed.
        assert!(item.trail.contains(&"send"));
        assert!(item.trail.contains(&"recv"));
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        struct CountingStage {
            current: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl PipelineStage<TestItem> for CountingStage {
            fn name(&self) -> &'static str {
                "counting"
            }
            fn is_for_stage(&self, _item: &TestItem) -> bool {
                true
            }
            async fn run(&self, item: TestItem, _pipe: Option<StagePipe>) -> TestItem {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                item
            }
        }

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pipeline = WorkPipeline::new(
            vec![Arc::new(CountingStage {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            }) as Arc<dyn PipelineStage<TestItem>>],
            3,
        );
        let receivers: Vec<_> = (0..20).map(|_| pipeline.submit(TestItem::default())).collect();
        for rx in receivers {
            rx.await.unwrap();
        }
        pipeline.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn dropped_writer_without_final_frame_is_an_error() {
        let (writer, mut reader) = byte_pipe();
        drop(writer);
        assert!(matches!(reader.read().await, Err(BackupError::PipeConnectionEof)));
    }
}
