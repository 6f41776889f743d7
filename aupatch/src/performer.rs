// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The payload application engine. Payload bytes are pushed in via
//! [`DeltaPerformer::write`] in chunks of any size. Each operation runs as
//! soon as its blob is fully buffered and progress is checkpointed to a
//! [`Prefs`] store after every operation so that an interrupted update can be
//! resumed by a new process.

use std::{
    fmt,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use ring::digest::{Context, SHA256, digest};
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    bspatch::{self, Bspatch},
    crypto,
    format::{
        extent::{self, is_sparse},
        extent_writer::{
            self, BzipExtentWriter, DirectExtentWriter, ZeroPadExtentWriter, extents_capacity,
        },
        payload::{self, ParseStatus, PartitionKind, PayloadMetadata},
    },
    hash::{self, HashCalculator},
    prefs::{
        self, KEY_MANIFEST_METADATA_SIZE, KEY_NEXT_DATA_OFFSET, KEY_NEXT_OPERATION,
        KEY_RESUMED_UPDATE_FAILURES, KEY_SHA256_CONTEXT, KEY_SIGNATURE_BLOB,
        KEY_SIGNED_SHA256_CONTEXT, KEY_UPDATE_CHECK_RESPONSE_HASH, Prefs,
    },
    protobuf::chromeos_update_engine::{InstallOperation, PartitionInfo, install_operation::Type},
    stream::{self, HashingReader, ReadAt, ReadWriteAt, UserPosFile, WriteAt},
    terminator::Terminator,
    util::{self, NumBytes},
};

/// Resuming is refused after this many attempts so that an operation that
/// reliably crashes the process cannot cause an endless loop.
pub const MAX_RESUMED_UPDATE_FAILURES: i64 = 10;

const PROGRESS_LOG_INTERVAL: usize = 1000;

#[derive(Debug, Error)]
pub enum Error {
    // Metadata errors.
    #[error("Failed to parse payload metadata")]
    Metadata(#[source] payload::Error),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),
    #[error("Payload metadata is not signed")]
    MetadataSignatureMissing,
    #[error("Payload metadata signature does not match")]
    MetadataSignatureMismatch(#[source] payload::Error),
    // Update state errors.
    #[error("Invalid update state: {0}")]
    InvalidUpdateState(&'static str),
    #[error("Invalid base64 value for preference {0:?}")]
    InvalidPrefValue(&'static str, #[source] base64::DecodeError),
    #[error("Failed to restore hash context")]
    HashContext(#[from] hash::Error),
    #[error("Prefs error")]
    Prefs(#[from] prefs::Error),
    // Partition errors.
    #[error("No {0} partition was provided")]
    MissingPartition(PartitionKind),
    #[error("Expected {kind} source hash {expected}, but have {actual}")]
    SourcePartitionHashMismatch {
        kind: PartitionKind,
        expected: String,
        actual: String,
    },
    #[error("Expected {kind} target hash {expected}, but have {actual}")]
    TargetPartitionHashMismatch {
        kind: PartitionKind,
        expected: String,
        actual: String,
    },
    // Operation errors.
    #[error("Operation #{index}: Unsupported operation type: {value}")]
    UnsupportedOperation { index: usize, value: i32 },
    #[error("Operation #{index}: Blob at {offset} was already consumed (next data is at {buffer_offset})")]
    DataAlreadyConsumed {
        index: usize,
        offset: u64,
        buffer_offset: u64,
    },
    #[error("Operation #{index}: Expected blob at offset {expected}, but have {actual}")]
    UnexpectedDataOffset {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("Operation #{0}: Blob has no hash")]
    OperationHashMissing(usize),
    #[error("Operation #{index}: Expected blob hash {expected}, but have {actual}")]
    OperationHashMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("Operation #{index}: Invalid signature operation: {reason}")]
    InvalidSignatureOperation { index: usize, reason: &'static str },
    #[error("Operation #{index}: MOVE must not have a blob")]
    MoveWithData { index: usize },
    #[error("Operation #{index}: MOVE has {src} source blocks, but {dst} destination blocks")]
    MoveBlockMismatch { index: usize, src: u64, dst: u64 },
    #[error("Operation #{index}: Destination extents hold {capacity} bytes, but length is {length}")]
    DestinationTooSmall {
        index: usize,
        capacity: u64,
        length: u64,
    },
    #[error("Operation #{index}: Size too large: {size}")]
    OperationTooLarge { index: usize, size: u64 },
    #[error("Operation #{index}: bspatch requires {kind} partition to have a path")]
    BsdiffNeedsPath { index: usize, kind: PartitionKind },
    #[error("Operation #{index}: Failed to write blob")]
    ExtentWriter {
        index: usize,
        #[source]
        source: extent_writer::Error,
    },
    #[error("Operation #{index}: Invalid extents")]
    Extent {
        index: usize,
        #[source]
        source: extent::Error,
    },
    #[error("Operation #{index}: Failed to apply binary patch")]
    Bspatch {
        index: usize,
        #[source]
        source: bspatch::Error,
    },
    #[error("Operation #{index}: I/O error")]
    OperationIo {
        index: usize,
        #[source]
        source: io::Error,
    },
    // Verification errors.
    #[error("Only {done} of {total} operations were applied")]
    PayloadVerification { done: usize, total: usize },
    #[error("Expected payload size {expected}, but have {actual}")]
    PayloadSizeMismatch { expected: u64, actual: u64 },
    #[error("Expected payload hash {expected}, but have {actual}")]
    PayloadHashMismatch { expected: String, actual: String },
    #[error("Payload is not signed, but a public key was provided")]
    SignedPayloadExpected,
    #[error("Payload signature does not match")]
    PayloadSignatureMismatch(#[source] payload::Error),
    // Lifecycle errors.
    #[error("{0} bytes of input were not consumed by any operation")]
    TrailingData(usize),
    #[error("Payload application already failed")]
    AlreadyFailed,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Broad classes of errors for callers to decide between retrying with a
/// fresh download and giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The payload data is damaged. Downloading it again may help.
    Corruption,
    /// The payload does not match what was expected or is not trusted.
    Verification,
    /// The payload or the caller violated an invariant.
    Defect,
    /// The target partitions or the prefs store failed.
    Io,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Metadata(_)
            | Self::OperationHashMismatch { .. }
            | Self::Bspatch {
                source: bspatch::Error::CommandExecution(..),
                ..
            }
            | Self::ExtentWriter {
                source:
                    extent_writer::Error::Bzip2(_)
                    | extent_writer::Error::Gzip(_)
                    | extent_writer::Error::TrailingData(_)
                    | extent_writer::Error::TruncatedStream,
                ..
            } => ErrorCategory::Corruption,
            Self::MetadataSignatureMissing
            | Self::MetadataSignatureMismatch(_)
            | Self::OperationHashMissing(_)
            | Self::SourcePartitionHashMismatch { .. }
            | Self::TargetPartitionHashMismatch { .. }
            | Self::PayloadSizeMismatch { .. }
            | Self::PayloadHashMismatch { .. }
            | Self::SignedPayloadExpected
            | Self::PayloadSignatureMismatch(_) => ErrorCategory::Verification,
            Self::Prefs(_)
            | Self::Io(_)
            | Self::OperationIo { .. }
            | Self::Bspatch {
                source: bspatch::Error::CommandSpawn(..),
                ..
            }
            | Self::ExtentWriter {
                source: extent_writer::Error::Write { .. },
                ..
            } => ErrorCategory::Io,
            _ => ErrorCategory::Defect,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Information about the update that comes from whoever negotiated it.
#[derive(Clone, Debug, Default)]
pub struct InstallPlan {
    /// SHA-256 of the entire payload. Progress is only resumed if it belongs
    /// to a payload with the same hash.
    pub payload_hash: Vec<u8>,
    /// Serialized `Signatures` message of the payload metadata.
    pub metadata_signature: Option<Vec<u8>>,
    /// SHA-256 of the current partition contents, compared against the old
    /// partition info of delta payloads.
    pub source_rootfs_hash: Option<Vec<u8>>,
    pub source_kernel_hash: Option<Vec<u8>>,
    /// Reject operation blobs that have no hash.
    pub hash_checks_mandatory: bool,
}

#[derive(Clone, Debug)]
pub struct ApplyOptions {
    pub bspatch: Bspatch,
    /// Key for verifying the payload and metadata signatures.
    pub public_key: Option<RsaPublicKey>,
    /// Fail on a missing or invalid metadata signature instead of warning.
    pub enforce_metadata_signature: bool,
    pub terminator: Arc<Terminator>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            bspatch: Bspatch::default(),
            public_key: None,
            enforce_metadata_signature: false,
            terminator: Arc::new(Terminator::new()),
        }
    }
}

/// A target partition. The path is only needed for BSDIFF operations because
/// the external patcher opens the partition itself.
pub struct Partition {
    file: Box<dyn ReadWriteAt>,
    path: Option<PathBuf>,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Partition {
    pub fn new(file: impl ReadWriteAt + 'static) -> Self {
        Self {
            file: Box::new(file),
            path: None,
        }
    }

    /// Open an existing partition device or image for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Box::new(file),
            path: Some(path.to_owned()),
        })
    }

    pub fn file(&self) -> &dyn ReadWriteAt {
        &*self.file
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// SHA-256 of the first `size` bytes of a partition.
pub fn hash_partition(
    file: &(impl ReadAt + ?Sized),
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<Vec<u8>> {
    let mut reader = HashingReader::new(UserPosFile::new(file), Context::new(&SHA256));
    stream::drain_n(&mut reader, size, cancel_signal)?;

    let (_, context) = reader.finish();

    Ok(context.finish().as_ref().to_vec())
}

/// Check that a partition matches its expected size and hash.
pub fn verify_partition_hash(
    file: &(impl ReadAt + ?Sized),
    kind: PartitionKind,
    info: &PartitionInfo,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let actual = hash_partition(file, info.size(), cancel_signal)?;

    if actual != info.hash() {
        return Err(Error::TargetPartitionHashMismatch {
            kind,
            expected: hex::encode(info.hash()),
            actual: hex::encode(actual),
        });
    }

    Ok(())
}

/// Where a resumed update continues in the payload. The caller must deliver
/// the metadata (`0..metadata_size`) followed by everything from
/// [`ResumePoint::payload_offset`] onwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    pub metadata_size: u64,
    pub data_offset: u64,
}

impl ResumePoint {
    pub fn payload_offset(&self) -> u64 {
        self.metadata_size + self.data_offset
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    AwaitingManifest,
    ApplyingOperations,
    Complete,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// All buffered data was processed. The next operation needs more data.
    NeedMoreData,
    /// Every operation has been applied.
    Complete,
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidUpdateState("value exceeds i64 range"))
}

fn get_base64(prefs: &dyn Prefs, key: &'static str) -> Result<Option<Vec<u8>>> {
    match prefs.get_string(key)? {
        Some(s) if !s.trim().is_empty() => STANDARD
            .decode(s.trim())
            .map(Some)
            .map_err(|e| Error::InvalidPrefValue(key, e)),
        _ => Ok(None),
    }
}

pub struct DeltaPerformer<'a> {
    prefs: &'a mut dyn Prefs,
    plan: InstallPlan,
    options: ApplyOptions,
    rootfs: Option<Partition>,
    kernel: Option<Partition>,
    state: State,
    metadata: Option<PayloadMetadata>,
    block_size: u32,
    /// Received bytes that have not been consumed by an operation yet.
    buffer: Vec<u8>,
    /// Blob section offset of the first byte in `buffer`.
    buffer_offset: u64,
    last_checkpointed_offset: Option<u64>,
    next_operation: usize,
    hasher: HashCalculator,
    /// Hash context right before the signature blob.
    signed_hash_context: Option<Vec<u8>>,
    signatures_message: Option<Vec<u8>>,
}

impl fmt::Debug for DeltaPerformer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaPerformer")
            .field("state", &self.state)
            .field("next_operation", &self.next_operation)
            .field("buffer_offset", &self.buffer_offset)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<'a> DeltaPerformer<'a> {
    pub fn new(prefs: &'a mut dyn Prefs, plan: InstallPlan, options: ApplyOptions) -> Self {
        Self {
            prefs,
            plan,
            options,
            rootfs: None,
            kernel: None,
            state: State::AwaitingManifest,
            metadata: None,
            block_size: 0,
            buffer: vec![],
            buffer_offset: 0,
            last_checkpointed_offset: None,
            next_operation: 0,
            hasher: HashCalculator::new(),
            signed_hash_context: None,
            signatures_message: None,
        }
    }

    pub fn set_partition(&mut self, kind: PartitionKind, partition: Partition) {
        match kind {
            PartitionKind::Rootfs => self.rootfs = Some(partition),
            PartitionKind::Kernel => self.kernel = Some(partition),
        }
    }

    pub fn partition(&self, kind: PartitionKind) -> Option<&Partition> {
        match kind {
            PartitionKind::Rootfs => self.rootfs.as_ref(),
            PartitionKind::Kernel => self.kernel.as_ref(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn metadata(&self) -> Option<&PayloadMetadata> {
        self.metadata.as_ref()
    }

    pub fn next_operation(&self) -> usize {
        self.next_operation
    }

    pub fn total_operations(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.total_operations())
    }

    pub fn buffer_offset(&self) -> u64 {
        self.buffer_offset
    }

    /// SHA-256 of all payload bytes consumed so far.
    pub fn current_hash(&self) -> [u8; 32] {
        self.hasher.finish()
    }

    pub fn terminator(&self) -> &Arc<Terminator> {
        &self.options.terminator
    }

    /// Feed the next chunk of payload data.
    pub fn write(&mut self, data: &[u8]) -> Result<WriteStatus> {
        if self.state == State::Failed {
            return Err(Error::AlreadyFailed);
        }

        self.buffer.extend_from_slice(data);

        self.process().inspect_err(|e| self.fail(e))
    }

    /// Call after the last write. Fails if data was left over that no
    /// operation consumed.
    pub fn close(&mut self) -> Result<()> {
        for partition in [&self.rootfs, &self.kernel].into_iter().flatten() {
            partition.file().file_flush()?;
        }

        if !self.buffer.is_empty() {
            return Err(Error::TrailingData(self.buffer.len()));
        }

        Ok(())
    }

    /// Check the payload as a whole once all operations are applied. On
    /// success, the saved update progress is erased.
    pub fn verify_payload(&mut self, expected_hash: &[u8], expected_size: u64) -> Result<()> {
        self.check_payload(expected_hash, expected_size)
            .inspect_err(|e| self.fail(e))?;

        info!("Payload verified successfully");

        Self::reset_update_progress(&mut *self.prefs, false)?;

        Ok(())
    }

    /// Check the new partition contents against the manifest's new partition
    /// info.
    pub fn verify_target_partitions(&self) -> Result<()> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or(Error::InvalidUpdateState("metadata not parsed"))?;

        for kind in [PartitionKind::Rootfs, PartitionKind::Kernel] {
            let Some(info) = metadata.new_partition_info(kind) else {
                continue;
            };
            if info.hash().is_empty() {
                continue;
            }

            let partition = self.partition(kind).ok_or(Error::MissingPartition(kind))?;

            verify_partition_hash(
                partition.file(),
                kind,
                info,
                self.options.terminator.cancel_signal(),
            )?;

            info!("Verified new {kind} partition hash");
        }

        Ok(())
    }

    /// Whether the saved progress can be used to resume the payload with the
    /// given hash.
    pub fn can_resume_update(prefs: &dyn Prefs, payload_hash: &[u8]) -> bool {
        Self::can_resume_update_with_limit(prefs, payload_hash, MAX_RESUMED_UPDATE_FAILURES)
    }

    /// Like [`Self::can_resume_update`], but with a custom limit for the
    /// number of resume attempts.
    pub fn can_resume_update_with_limit(
        prefs: &dyn Prefs,
        payload_hash: &[u8],
        max_failures: i64,
    ) -> bool {
        match Self::resume_blocker(prefs, payload_hash, max_failures) {
            Ok(None) => true,
            Ok(Some(reason)) => {
                info!("Cannot resume update: {reason}");
                false
            }
            Err(e) => {
                warn!("Cannot resume update: {e}");
                false
            }
        }
    }

    fn resume_blocker(
        prefs: &dyn Prefs,
        payload_hash: &[u8],
        max_failures: i64,
    ) -> prefs::Result<Option<&'static str>> {
        if !prefs.get_i64(KEY_NEXT_OPERATION)?.is_some_and(|n| n > 0) {
            return Ok(Some("no operation was checkpointed"));
        }

        let response_hash = prefs
            .get_string(KEY_UPDATE_CHECK_RESPONSE_HASH)?
            .unwrap_or_default();
        if response_hash.is_empty() || response_hash != STANDARD.encode(payload_hash) {
            return Ok(Some("progress belongs to a different payload"));
        }

        if prefs
            .get_i64(KEY_RESUMED_UPDATE_FAILURES)?
            .is_some_and(|n| n > max_failures)
        {
            return Ok(Some("too many resume attempts"));
        }

        if !prefs.get_i64(KEY_NEXT_DATA_OFFSET)?.is_some_and(|n| n >= 0) {
            return Ok(Some("no data offset was checkpointed"));
        }

        if prefs
            .get_string(KEY_SHA256_CONTEXT)?
            .is_none_or(|s| s.is_empty())
        {
            return Ok(Some("no hash context was checkpointed"));
        }

        if !prefs
            .get_i64(KEY_MANIFEST_METADATA_SIZE)?
            .is_some_and(|n| n > 0)
        {
            return Ok(Some("no metadata size was saved"));
        }

        Ok(None)
    }

    /// Erase the saved progress. A quick reset only invalidates the next
    /// operation index, which is enough to prevent resuming.
    pub fn reset_update_progress(prefs: &mut dyn Prefs, quick: bool) -> prefs::Result<()> {
        prefs.set_i64(KEY_NEXT_OPERATION, -1)?;

        if !quick {
            prefs.set_string(KEY_UPDATE_CHECK_RESPONSE_HASH, "")?;
            prefs.set_i64(KEY_NEXT_DATA_OFFSET, -1)?;
            prefs.set_string(KEY_SHA256_CONTEXT, "")?;
            prefs.set_string(KEY_SIGNED_SHA256_CONTEXT, "")?;
            prefs.set_string(KEY_SIGNATURE_BLOB, "")?;
            prefs.set_i64(KEY_MANIFEST_METADATA_SIZE, -1)?;
            prefs.set_i64(KEY_RESUMED_UPDATE_FAILURES, 0)?;
        }

        Ok(())
    }

    /// The payload ranges that must be delivered to resume from the saved
    /// progress.
    pub fn resume_point(prefs: &dyn Prefs) -> prefs::Result<Option<ResumePoint>> {
        let metadata_size = prefs.get_i64(KEY_MANIFEST_METADATA_SIZE)?;
        let data_offset = prefs.get_i64(KEY_NEXT_DATA_OFFSET)?;

        match (metadata_size, data_offset) {
            (Some(m), Some(d)) if m > 0 && d >= 0 => Ok(Some(ResumePoint {
                metadata_size: m as u64,
                data_offset: d as u64,
            })),
            _ => Ok(None),
        }
    }

    fn fail(&mut self, e: &Error) {
        error!("Failed to apply payload: {e}");

        self.state = State::Failed;
        self.options.terminator.set_exit_blocked(false);

        if let Err(e) = Self::reset_update_progress(&mut *self.prefs, false) {
            warn!("Failed to reset update progress: {e}");
        }
    }

    fn process(&mut self) -> Result<WriteStatus> {
        if self.state == State::AwaitingManifest {
            match payload::parse_metadata(&self.buffer).map_err(Error::Metadata)? {
                ParseStatus::InsufficientData => return Ok(WriteStatus::NeedMoreData),
                ParseStatus::Complete(metadata) => self.load_metadata(metadata)?,
            }
        }

        if self.state == State::Complete {
            return Ok(WriteStatus::Complete);
        }

        let total = self.total_operations();

        while self.next_operation < total {
            let index = self.next_operation;
            let (kind, op) = self
                .metadata
                .as_ref()
                .and_then(|m| m.operation(index))
                .map(|(k, op)| (k, op.clone()))
                .ok_or(Error::InvalidUpdateState("operation index out of range"))?;

            if !self.can_perform_operation(index, &op)? {
                return Ok(WriteStatus::NeedMoreData);
            }

            // Exit may be blocked by a non-idempotent operation or the
            // checkpoint. Either way, it is safe again once this iteration
            // completes.
            let _unblocker = self.options.terminator.unblocker();

            self.validate_operation_hash(index, &op)?;
            self.perform_operation(index, kind, &op)?;

            self.next_operation += 1;
            self.log_progress(total);
            self.checkpoint()?;
        }

        info!("All {total} operations applied");
        self.state = State::Complete;

        Ok(WriteStatus::Complete)
    }

    fn load_metadata(&mut self, metadata: PayloadMetadata) -> Result<()> {
        let block_size = metadata.block_size();
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        let metadata_size = metadata.metadata_size;

        self.check_metadata_signature(metadata_size as usize)?;
        self.discard_buffer_head(metadata_size as usize);

        Self::log_partition_info(&metadata);

        self.block_size = block_size;
        self.metadata = Some(metadata);
        self.state = State::ApplyingOperations;

        self.prime_update_state(metadata_size)
    }

    fn check_metadata_signature(&self, metadata_size: usize) -> Result<()> {
        let Some(key) = &self.options.public_key else {
            return Ok(());
        };

        let result = match &self.plan.metadata_signature {
            Some(s) => payload::verify_metadata_signature(&self.buffer[..metadata_size], s, key)
                .map_err(Error::MetadataSignatureMismatch),
            None => Err(Error::MetadataSignatureMissing),
        };

        match result {
            Ok(()) => {
                info!("Metadata signature verified");
                Ok(())
            }
            Err(e) if self.options.enforce_metadata_signature => Err(e),
            Err(e) => {
                warn!("Ignoring metadata signature failure: {e}");
                Ok(())
            }
        }
    }

    fn log_partition_info(metadata: &PayloadMetadata) {
        for kind in [PartitionKind::Rootfs, PartitionKind::Kernel] {
            for (label, info) in [
                ("old", metadata.old_partition_info(kind)),
                ("new", metadata.new_partition_info(kind)),
            ] {
                if let Some(info) = info {
                    info!(
                        "{label} {kind}: size={:?}, hash={}",
                        NumBytes(info.size()),
                        hex::encode(info.hash()),
                    );
                }
            }
        }
    }

    fn prime_update_state(&mut self, metadata_size: u64) -> Result<()> {
        let next_operation = self.prefs.get_i64(KEY_NEXT_OPERATION)?;

        let next_operation = match next_operation {
            Some(n) if n > 0 => n,
            _ => {
                info!("Starting new update");

                self.verify_source_partitions()?;

                // Stale values from an earlier attempt must never be mixed
                // with the new progress.
                Self::reset_update_progress(&mut *self.prefs, false)?;
                self.prefs.set_string(
                    KEY_UPDATE_CHECK_RESPONSE_HASH,
                    &STANDARD.encode(&self.plan.payload_hash),
                )?;
                self.prefs
                    .set_i64(KEY_MANIFEST_METADATA_SIZE, to_i64(metadata_size)?)?;

                return Ok(());
            }
        };

        let next_operation = usize::try_from(next_operation)
            .ok()
            .filter(|&n| n <= self.total_operations())
            .ok_or(Error::InvalidUpdateState("next operation out of range"))?;

        let next_data_offset = self
            .prefs
            .get_i64(KEY_NEXT_DATA_OFFSET)?
            .and_then(|n| u64::try_from(n).ok())
            .ok_or(Error::InvalidUpdateState("missing next data offset"))?;

        let saved_metadata_size = self
            .prefs
            .get_i64(KEY_MANIFEST_METADATA_SIZE)?
            .filter(|&n| n > 0)
            .ok_or(Error::InvalidUpdateState("missing metadata size"))?;
        if saved_metadata_size != to_i64(metadata_size)? {
            return Err(Error::InvalidUpdateState("metadata size changed"));
        }

        let context = get_base64(&*self.prefs, KEY_SHA256_CONTEXT)?
            .ok_or(Error::InvalidUpdateState("missing hash context"))?;
        let hasher = HashCalculator::from_context(&context)?;
        if hasher.bytes_processed() != metadata_size + next_data_offset {
            return Err(Error::InvalidUpdateState(
                "hash context does not match data offset",
            ));
        }

        // The signature is persisted before the checkpoint of its operation.
        // If that checkpoint never happened, the operation runs again and
        // extracts the signature anew.
        if self
            .signature_operation_index()
            .is_some_and(|i| i < next_operation)
        {
            self.signed_hash_context = get_base64(&*self.prefs, KEY_SIGNED_SHA256_CONTEXT)?;
            self.signatures_message = get_base64(&*self.prefs, KEY_SIGNATURE_BLOB)?;
        }
        self.hasher = hasher;
        self.next_operation = next_operation;
        self.buffer_offset = next_data_offset;
        self.last_checkpointed_offset = Some(next_data_offset);

        let failures = self
            .prefs
            .get_i64(KEY_RESUMED_UPDATE_FAILURES)?
            .unwrap_or(0);
        self.prefs
            .set_i64(KEY_RESUMED_UPDATE_FAILURES, failures.saturating_add(1))?;

        info!(
            "Resuming update at operation #{next_operation} with data offset {next_data_offset} \
            (attempt {})",
            failures.saturating_add(1),
        );

        Ok(())
    }

    fn verify_source_partitions(&self) -> Result<()> {
        let Some(metadata) = &self.metadata else {
            return Ok(());
        };

        for kind in [PartitionKind::Rootfs, PartitionKind::Kernel] {
            let Some(info) = metadata.old_partition_info(kind) else {
                continue;
            };

            let actual = match kind {
                PartitionKind::Rootfs => self.plan.source_rootfs_hash.as_deref(),
                PartitionKind::Kernel => self.plan.source_kernel_hash.as_deref(),
            };

            if actual != Some(info.hash()) {
                return Err(Error::SourcePartitionHashMismatch {
                    kind,
                    expected: hex::encode(info.hash()),
                    actual: actual.map_or_else(|| "<unknown>".to_owned(), hex::encode),
                });
            }

            debug!("Verified old {kind} partition hash");
        }

        Ok(())
    }

    fn is_signature_operation(&self, op: &InstallOperation) -> bool {
        let Some(metadata) = &self.metadata else {
            return false;
        };

        op.r#type == Type::Replace as i32
            && metadata
                .manifest
                .signatures_offset
                .is_some_and(|o| o == op.data_offset())
    }

    fn signature_operation_index(&self) -> Option<usize> {
        let metadata = self.metadata.as_ref()?;

        (0..metadata.total_operations()).find(|&i| {
            metadata
                .operation(i)
                .is_some_and(|(_, op)| self.is_signature_operation(op))
        })
    }

    fn can_perform_operation(&self, index: usize, op: &InstallOperation) -> Result<bool> {
        if op.r#type == Type::Move as i32 {
            // A MOVE never waits for data, so a blob must be rejected before
            // anything tries to read it from the buffer.
            if op.data_length() != 0 {
                return Err(Error::MoveWithData { index });
            }

            return Ok(true);
        }

        let offset = op.data_offset();
        let length = op.data_length();

        if length > 0 && offset < self.buffer_offset {
            return Err(Error::DataAlreadyConsumed {
                index,
                offset,
                buffer_offset: self.buffer_offset,
            });
        }

        let end = offset
            .checked_add(length)
            .ok_or(Error::OperationTooLarge {
                index,
                size: length,
            })?;

        Ok(length == 0 || end <= self.buffer_offset + self.buffer.len() as u64)
    }

    fn validate_operation_hash(&self, index: usize, op: &InstallOperation) -> Result<()> {
        let length = op.data_length();
        if length == 0 {
            return Ok(());
        }

        if op.data_offset() != self.buffer_offset {
            return Err(Error::UnexpectedDataOffset {
                index,
                expected: self.buffer_offset,
                actual: op.data_offset(),
            });
        }

        let expected = op.data_sha256_hash();
        if expected.is_empty() {
            if self.is_signature_operation(op) {
                return Ok(());
            } else if self.plan.hash_checks_mandatory {
                return Err(Error::OperationHashMissing(index));
            }

            warn!("Operation #{index}: Blob has no hash; skipping verification");
            return Ok(());
        }

        let actual = digest(&SHA256, &self.buffer[..length as usize]);

        if actual.as_ref() != expected {
            return Err(Error::OperationHashMismatch {
                index,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        Ok(())
    }

    fn perform_operation(
        &mut self,
        index: usize,
        kind: PartitionKind,
        op: &InstallOperation,
    ) -> Result<()> {
        let op_type = Type::try_from(op.r#type).map_err(|_| Error::UnsupportedOperation {
            index,
            value: op.r#type,
        })?;

        if op.dst_length.is_some() {
            let capacity = extents_capacity(&op.dst_extents, self.block_size);
            if capacity < op.dst_length() {
                return Err(Error::DestinationTooSmall {
                    index,
                    capacity,
                    length: op.dst_length(),
                });
            }
        }

        debug!(
            "Operation #{index}: {} on {kind}: {} -> {}",
            op_type.as_str_name(),
            extent::extents_to_string(&op.src_extents),
            extent::extents_to_string(&op.dst_extents),
        );

        match op_type {
            Type::Replace | Type::ReplaceBz => {
                if self.is_signature_operation(op) {
                    self.extract_signature_message(index, op)?;
                }

                self.perform_replace(index, kind, op_type, op)?;
            }
            Type::Move => self.perform_move(index, kind, op)?,
            Type::Bsdiff => self.perform_bsdiff(index, kind, op)?,
        }

        self.discard_buffer_head(op.data_length() as usize);

        Ok(())
    }

    fn partition_or_err(&self, kind: PartitionKind) -> Result<&Partition> {
        self.partition(kind).ok_or(Error::MissingPartition(kind))
    }

    fn perform_replace(
        &self,
        index: usize,
        kind: PartitionKind,
        op_type: Type,
        op: &InstallOperation,
    ) -> Result<()> {
        let partition = self.partition_or_err(kind)?;
        let data = &self.buffer[..op.data_length() as usize];

        let direct = DirectExtentWriter::new(partition.file(), &op.dst_extents, self.block_size);
        let writer = ZeroPadExtentWriter::new(direct, self.block_size);

        let result = if op_type == Type::ReplaceBz {
            extent_writer::write_all(BzipExtentWriter::new(writer), data)
        } else {
            extent_writer::write_all(writer, data)
        };

        result.map_err(|e| Error::ExtentWriter { index, source: e })
    }

    fn perform_move(&mut self, index: usize, kind: PartitionKind, op: &InstallOperation) -> Result<()> {
        let src_blocks = extent::total_blocks(&op.src_extents);
        let dst_blocks = extent::total_blocks(&op.dst_extents);
        if src_blocks != dst_blocks {
            return Err(Error::MoveBlockMismatch {
                index,
                src: src_blocks,
                dst: dst_blocks,
            });
        }

        let block_size = u64::from(self.block_size);
        let size = src_blocks
            .checked_mul(block_size)
            .and_then(|s| usize::try_from(s).ok())
            .ok_or(Error::OperationTooLarge {
                index,
                size: src_blocks,
            })?;

        // The entire source is read before anything is written, so overlap
        // between the source and destination within this operation is fine.
        let mut data = vec![0u8; size];

        {
            let file = self.partition_or_err(kind)?.file();
            let mut pos = 0;

            for extent in &op.src_extents {
                let n = (extent.num_blocks() * block_size) as usize;

                if !is_sparse(extent) {
                    file.read_exact_at(&mut data[pos..pos + n], extent.start_block() * block_size)
                        .map_err(|e| Error::OperationIo { index, source: e })?;
                }

                pos += n;
            }
        }

        self.handle_non_idempotent(op)?;

        let file = self.partition_or_err(kind)?.file();
        let writer = DirectExtentWriter::new(file, &op.dst_extents, self.block_size);

        extent_writer::write_all(writer, &data).map_err(|e| Error::ExtentWriter { index, source: e })
    }

    fn perform_bsdiff(
        &mut self,
        index: usize,
        kind: PartitionKind,
        op: &InstallOperation,
    ) -> Result<()> {
        let src_positions =
            extent::extents_to_bsdiff_positions(&op.src_extents, self.block_size, op.src_length())
                .map_err(|e| Error::Extent { index, source: e })?;
        let dst_positions =
            extent::extents_to_bsdiff_positions(&op.dst_extents, self.block_size, op.dst_length())
                .map_err(|e| Error::Extent { index, source: e })?;

        let partition = self.partition_or_err(kind)?;
        let path = partition
            .path()
            .ok_or(Error::BsdiffNeedsPath { index, kind })?
            .to_owned();

        let io_err = |e| Error::OperationIo { index, source: e };

        let mut patch = tempfile::Builder::new()
            .prefix("au_patch.")
            .tempfile()
            .map_err(io_err)?;
        patch
            .write_all(&self.buffer[..op.data_length() as usize])
            .map_err(io_err)?;
        patch.flush().map_err(io_err)?;

        // The patcher opens the partition by path.
        partition.file().file_flush().map_err(io_err)?;

        self.handle_non_idempotent(op)?;

        self.options
            .bspatch
            .apply(&path, &path, patch.path(), &src_positions, &dst_positions)
            .map_err(|e| Error::Bspatch { index, source: e })?;

        let block_size = u64::from(self.block_size);
        let tail = op.dst_length() % block_size;

        if tail != 0 {
            if let Some(last) = op.dst_extents.last().filter(|e| !is_sparse(e)) {
                let end = (last.start_block() + last.num_blocks()) * block_size;
                let size = block_size - tail;

                self.partition_or_err(kind)?
                    .file()
                    .write_zeros_at(end - size, size)
                    .map_err(io_err)?;
            }
        }

        Ok(())
    }

    /// Make sure a crash while the operation runs leads to a clean restart
    /// instead of a resume from a partially overwritten source.
    fn handle_non_idempotent(&mut self, op: &InstallOperation) -> Result<()> {
        if extent::is_idempotent(&op.src_extents, &op.dst_extents) {
            return Ok(());
        }

        debug!("Operation is not idempotent; invalidating progress");

        self.options.terminator.set_exit_blocked(true);
        Self::reset_update_progress(&mut *self.prefs, true)?;

        Ok(())
    }

    fn extract_signature_message(&mut self, index: usize, op: &InstallOperation) -> Result<()> {
        let Some(metadata) = &self.metadata else {
            return Err(Error::InvalidUpdateState("metadata not parsed"));
        };

        let offset = metadata.manifest.signatures_offset();
        let size = metadata.manifest.signatures_size();

        if op.data_length() != size {
            return Err(Error::InvalidSignatureOperation {
                index,
                reason: "size does not match signatures_size",
            });
        } else if self.signatures_message.is_some() {
            return Err(Error::InvalidSignatureOperation {
                index,
                reason: "signature was already extracted",
            });
        } else if self.buffer_offset != offset {
            return Err(Error::InvalidSignatureOperation {
                index,
                reason: "signature does not start at the current offset",
            });
        }

        let blob = self.buffer[..size as usize].to_vec();
        let context = self.hasher.context();

        self.prefs
            .set_string(KEY_SIGNATURE_BLOB, &STANDARD.encode(&blob))?;
        self.prefs
            .set_string(KEY_SIGNED_SHA256_CONTEXT, &STANDARD.encode(&context))?;

        info!("Extracted signature data of size {:?} at {offset}", NumBytes(size));

        self.signatures_message = Some(blob);
        self.signed_hash_context = Some(context);

        Ok(())
    }

    /// Drop consumed bytes from the front of the buffer after adding them to
    /// the running hash.
    fn discard_buffer_head(&mut self, count: usize) {
        self.hasher.update(&self.buffer[..count]);
        self.buffer.drain(..count);

        if self.state == State::ApplyingOperations {
            self.buffer_offset += count as u64;
        }
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.options.terminator.set_exit_blocked(true);

        if self.last_checkpointed_offset != Some(self.buffer_offset) {
            // Invalidate first so that a crash between the writes below never
            // pairs the old operation index with the new offset.
            Self::reset_update_progress(&mut *self.prefs, true)?;

            self.prefs
                .set_string(KEY_SHA256_CONTEXT, &STANDARD.encode(self.hasher.context()))?;
            self.prefs
                .set_i64(KEY_NEXT_DATA_OFFSET, to_i64(self.buffer_offset)?)?;

            self.last_checkpointed_offset = Some(self.buffer_offset);
        }

        self.prefs
            .set_i64(KEY_NEXT_OPERATION, to_i64(self.next_operation as u64)?)?;

        Ok(())
    }

    fn log_progress(&self, total: usize) {
        let done = self.next_operation;
        let percent = util::percent(done as u64, total as u64);

        if done == 1 || done == total || done % PROGRESS_LOG_INTERVAL == 0 {
            info!("Completed {done}/{total} operations ({percent}%)");
        } else {
            debug!("Completed {done}/{total} operations ({percent}%)");
        }
    }

    fn check_payload(&self, expected_hash: &[u8], expected_size: u64) -> Result<()> {
        let total = self.total_operations();
        if self.state != State::Complete {
            return Err(Error::PayloadVerification {
                done: self.next_operation,
                total,
            });
        }

        let metadata_size = self.metadata.as_ref().map_or(0, |m| m.metadata_size);
        let actual_size = metadata_size + self.buffer_offset;
        if actual_size != expected_size {
            return Err(Error::PayloadSizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }

        let actual_hash = self.hasher.finish();
        if expected_hash.is_empty() || actual_hash != expected_hash {
            return Err(Error::PayloadHashMismatch {
                expected: hex::encode(expected_hash),
                actual: hex::encode(actual_hash),
            });
        }

        let Some(key) = &self.options.public_key else {
            info!("No public key; skipping payload signature verification");
            return Ok(());
        };

        let (Some(blob), Some(context)) = (&self.signatures_message, &self.signed_hash_context)
        else {
            return Err(Error::SignedPayloadExpected);
        };

        let signed_digest = HashCalculator::from_context(context)?.finish();
        let signatures =
            payload::parse_signatures(blob).map_err(Error::PayloadSignatureMismatch)?;

        crypto::verify_digest(&signed_digest, &signatures, key)
            .map_err(|e| Error::PayloadSignatureMismatch(e.into()))?;

        info!("Payload signature verified");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{
        format::{extent::new_extent, payload::PayloadBuilder},
        prefs::MemoryPrefs,
        stream::MutexFile,
    };

    fn memory_partition(size: usize) -> (Arc<MutexFile<Cursor<Vec<u8>>>>, Partition) {
        let file = Arc::new(MutexFile::new(Cursor::new(vec![0u8; size])));
        let partition = Partition::new(file.clone());
        (file, partition)
    }

    #[test]
    fn error_categories() {
        assert_eq!(
            Error::OperationHashMismatch {
                index: 0,
                expected: String::new(),
                actual: String::new(),
            }
            .category(),
            ErrorCategory::Corruption,
        );
        assert_eq!(
            Error::PayloadSizeMismatch {
                expected: 1,
                actual: 2,
            }
            .category(),
            ErrorCategory::Verification,
        );
        assert_eq!(
            Error::MoveBlockMismatch {
                index: 0,
                src: 1,
                dst: 2,
            }
            .category(),
            ErrorCategory::Defect,
        );
        assert_eq!(
            Error::ExtentWriter {
                index: 0,
                source: extent_writer::Error::TruncatedStream,
            }
            .category(),
            ErrorCategory::Corruption,
        );
        assert_eq!(
            Error::Bspatch {
                index: 0,
                source: bspatch::Error::CommandSpawn(
                    util::DebugString::new("bspatch"),
                    io::Error::from(io::ErrorKind::NotFound),
                ),
            }
            .category(),
            ErrorCategory::Io,
        );
    }

    #[test]
    fn move_within_partition() {
        let mut builder = PayloadBuilder::new(4);
        let mut op = InstallOperation {
            src_extents: vec![new_extent(0, 2)],
            dst_extents: vec![new_extent(1, 2)],
            ..Default::default()
        };
        op.set_type(Type::Move);
        builder.add_operation(PartitionKind::Rootfs, op, &[]);
        let payload = builder.build(None).unwrap();

        let (file, partition) = memory_partition(12);
        file.write_all_at(b"abcdefgh", 0).unwrap();

        let mut prefs = MemoryPrefs::new();
        let mut performer = DeltaPerformer::new(
            &mut prefs,
            InstallPlan {
                payload_hash: payload.hash.to_vec(),
                ..Default::default()
            },
            ApplyOptions::default(),
        );
        performer.set_partition(PartitionKind::Rootfs, partition);

        assert_eq!(performer.write(&payload.data).unwrap(), WriteStatus::Complete);
        performer.close().unwrap();
        performer
            .verify_payload(&payload.hash, payload.data.len() as u64)
            .unwrap();

        let data = file.with_inner(|f| f.get_ref().clone());
        assert_eq!(data, b"abcdabcdefgh");
        assert!(!performer.terminator().exit_blocked());
    }

    #[test]
    fn move_rejects_block_mismatch() {
        let mut builder = PayloadBuilder::new(4);
        let mut op = InstallOperation {
            src_extents: vec![new_extent(0, 1)],
            dst_extents: vec![new_extent(1, 2)],
            ..Default::default()
        };
        op.set_type(Type::Move);
        builder.add_operation(PartitionKind::Rootfs, op, &[]);
        let payload = builder.build(None).unwrap();

        let (_, partition) = memory_partition(12);
        let mut prefs = MemoryPrefs::new();
        let mut performer =
            DeltaPerformer::new(&mut prefs, InstallPlan::default(), ApplyOptions::default());
        performer.set_partition(PartitionKind::Rootfs, partition);

        let err = performer.write(&payload.data).unwrap_err();
        assert!(
            matches!(err, Error::MoveBlockMismatch { index: 0, src: 1, dst: 2 }),
            "{err:?}",
        );
        assert_eq!(err.category(), ErrorCategory::Defect);
        assert_eq!(performer.state(), State::Failed);
        assert!(matches!(performer.write(&[]), Err(Error::AlreadyFailed)));
    }

    #[test]
    fn move_rejects_blob_before_buffering() {
        let mut builder = PayloadBuilder::new(4);
        let mut op = InstallOperation {
            src_extents: vec![new_extent(0, 1)],
            dst_extents: vec![new_extent(1, 1)],
            ..Default::default()
        };
        op.set_type(Type::Move);
        builder.add_operation(PartitionKind::Rootfs, op, &[0xaa; 100]);
        let payload = builder.build(None).unwrap();

        let (_, partition) = memory_partition(12);
        let mut prefs = MemoryPrefs::new();
        let mut performer =
            DeltaPerformer::new(&mut prefs, InstallPlan::default(), ApplyOptions::default());
        performer.set_partition(PartitionKind::Rootfs, partition);

        // Only part of the blob is available.
        let err = performer
            .write(&payload.data[..payload.metadata_size as usize + 10])
            .unwrap_err();
        assert!(matches!(err, Error::MoveWithData { index: 0 }), "{err:?}");
        assert_eq!(performer.state(), State::Failed);
    }

    #[test]
    fn missing_partition() {
        let mut builder = PayloadBuilder::new(4096);
        builder
            .add_full_image(PartitionKind::Kernel, b"kernel", 1, false)
            .unwrap();
        let payload = builder.build(None).unwrap();

        let mut prefs = MemoryPrefs::new();
        let mut performer =
            DeltaPerformer::new(&mut prefs, InstallPlan::default(), ApplyOptions::default());

        assert!(matches!(
            performer.write(&payload.data),
            Err(Error::MissingPartition(PartitionKind::Kernel))
        ));
    }
}
