use crate::codec::{self, FrameEncoder};
use crate::error::ItemError;
use crate::geometry;
use crate::jpeg;
use crate::metadata::{self, CameraIdentity, ExifTemplate, Orientation};
use crate::naming::NameSequencer;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Done,
    Error,
}

/// Final output for one successful item.
#[derive(Clone)]
pub struct EncodedPhoto {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub original_name: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for EncodedPhoto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedPhoto")
            .field("filename", &self.filename)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("original_name", &self.original_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Pipeline output before a sequence number is assigned.
#[derive(Debug)]
pub struct Rendered {
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// One queued input and its state.
#[derive(Debug)]
pub struct ProcessingItem {
    pub name: String,
    source: Vec<u8>,
    pub status: ItemStatus,
    pub output: Option<EncodedPhoto>,
    pub error: Option<String>,
}

impl ProcessingItem {
    pub fn new(name: impl Into<String>, source: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source,
            status: ItemStatus::Pending,
            output: None,
            error: None,
        }
    }
}

/// Raised to stop a batch; items not started yet stay `Pending`.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Decode -> normalize -> encode -> EXIF injection for a single photo.
pub struct PhotoPipeline {
    /// Built once and shared by every photo of the batch.
    exif_payload: Vec<u8>,
    encoder: Arc<dyn FrameEncoder>,
}

impl PhotoPipeline {
    pub fn new(camera: &CameraIdentity, encoder: Arc<dyn FrameEncoder>) -> Self {
        // Pixels are already upright, so viewers must not rotate again.
        let exif_payload = if camera.is_empty() {
            metadata::build_orientation_segment(Orientation::Normal)
        } else {
            ExifTemplate::with_camera(camera).build(Orientation::Normal)
        };
        Self {
            exif_payload,
            encoder,
        }
    }

    pub fn render(&self, bytes: &[u8]) -> Result<Rendered, ItemError> {
        let source = codec::decode(bytes)?;
        let frame = geometry::normalize(source);
        let (width, height) = (frame.width(), frame.height());
        tracing::trace!(orientation = ?frame.plan().orientation, "encoding frame");
        let raw = self.encoder.encode(&frame)?;
        drop(frame);
        let clean = jpeg::strip_app1(raw)?;
        let bytes = jpeg::inject_segment(&clean, &self.exif_payload)?;
        Ok(Rendered {
            width,
            height,
            bytes,
        })
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub done: Vec<EncodedPhoto>,
    /// (original name, reason)
    pub errors: Vec<(String, String)>,
}

/// State of one batch run. Each invocation gets its own value.
pub struct Batch {
    items: Vec<ProcessingItem>,
    sequencer: NameSequencer,
    cancel: CancelFlag,
}

impl Batch {
    pub fn new(inputs: Vec<(String, Vec<u8>)>, prefix: Option<&str>, start: Option<u32>) -> Self {
        Self {
            items: inputs
                .into_iter()
                .map(|(name, bytes)| ProcessingItem::new(name, bytes))
                .collect(),
            sequencer: NameSequencer::new(prefix, start),
            cancel: CancelFlag::default(),
        }
    }

    pub fn items(&self) -> &[ProcessingItem] {
        &self.items
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// One item at a time, in input order, naming each success as it lands.
    pub fn process_sequential(&mut self, pipeline: &PhotoPipeline) {
        for idx in 0..self.items.len() {
            if self.cancel.is_cancelled() {
                tracing::info!(remaining = self.items.len() - idx, "batch cancelled");
                break;
            }
            if self.items[idx].status != ItemStatus::Pending {
                continue;
            }
            let item = &mut self.items[idx];
            item.status = ItemStatus::Processing;
            tracing::debug!(item = %item.name, "processing");
            let source = std::mem::take(&mut item.source);
            let result = pipeline.render(&source);
            self.finish_item(idx, result);
        }
    }

    /// Run up to `workers` items at once on the blocking pool. Results are
    /// collected first and then named in input order, so the numbering is
    /// identical to a sequential run.
    pub async fn process_concurrent(&mut self, pipeline: Arc<PhotoPipeline>, workers: usize) {
        tracing::debug!(prefix = self.sequencer.prefix(), start = ?self.sequencer.current(), workers, "batch started");
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(self.items.len());
        for (idx, item) in self.items.iter_mut().enumerate() {
            if item.status != ItemStatus::Pending {
                continue;
            }
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            if self.cancel.is_cancelled() {
                tracing::info!("batch cancelled");
                break;
            }
            item.status = ItemStatus::Processing;
            tracing::debug!(item = %item.name, "processing");
            let source = std::mem::take(&mut item.source);
            let pipeline = Arc::clone(&pipeline);
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                pipeline.render(&source)
            });
            handles.push((idx, handle));
        }
        for (idx, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(ItemError::Worker(e.to_string())));
            self.finish_item(idx, result);
        }
    }

    fn finish_item(&mut self, idx: usize, result: Result<Rendered, ItemError>) {
        let item = &mut self.items[idx];
        let last = self.sequencer.current().unwrap_or(u32::MAX);
        let named = result.and_then(|rendered| match self.sequencer.take() {
            Some(filename) => Ok((filename, rendered)),
            None => Err(ItemError::NamesExhausted { last }),
        });
        match named {
            Ok((filename, rendered)) => {
                tracing::info!(item = %item.name, file = %filename, bytes = rendered.bytes.len(), "photo done");
                item.status = ItemStatus::Done;
                item.output = Some(EncodedPhoto {
                    filename,
                    width: rendered.width,
                    height: rendered.height,
                    original_name: item.name.clone(),
                    bytes: rendered.bytes,
                });
            }
            Err(e) => {
                tracing::warn!(item = %item.name, error = %e, "photo failed");
                item.status = ItemStatus::Error;
                item.error = Some(e.to_string());
            }
        }
    }

    pub fn into_outcome(self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for item in self.items {
            match item.status {
                ItemStatus::Done => outcome.done.extend(item.output),
                ItemStatus::Error => outcome
                    .errors
                    .push((item.name, item.error.unwrap_or_default())),
                ItemStatus::Pending | ItemStatus::Processing => {}
            }
        }
        outcome
    }
}

/// Sequential batch run with the default naming rules.
pub fn process_batch(
    pipeline: &PhotoPipeline,
    inputs: Vec<(String, Vec<u8>)>,
    prefix: Option<&str>,
    start_index: Option<u32>,
) -> BatchOutcome {
    let mut batch = Batch::new(inputs, prefix, start_index);
    batch.process_sequential(pipeline);
    batch.into_outcome()
}
