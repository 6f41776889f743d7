// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::{self, File},
    io::BufReader,
    ops::Range,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use crate::{
    bspatch::Bspatch,
    config::Config,
    crypto,
    format::payload::{self, PartitionKind, PayloadMetadata},
    performer::{self, ApplyOptions, DeltaPerformer, InstallPlan, Partition, ResumePoint},
    prefs::{FilePrefs, MemoryPrefs, Prefs},
    stream::{FileLen, ReadAt},
    terminator::Terminator,
    util::NumBytes,
};

/// Hex-encoded byte string argument.
#[derive(Clone)]
pub struct HexBytes(pub Vec<u8>);

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for HexBytes {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        hex::decode(s).map(Self)
    }
}

fn open_prefs(dir: Option<&Path>) -> Box<dyn Prefs> {
    match dir {
        Some(d) => Box::new(FilePrefs::new(d)),
        None => {
            warn!("No prefs directory specified; progress will not be saved");
            Box::new(MemoryPrefs::new())
        }
    }
}

fn source_hash(
    kind: PartitionKind,
    path: Option<&Path>,
    metadata: &PayloadMetadata,
    terminator: &Terminator,
) -> Result<Option<Vec<u8>>> {
    let (Some(path), Some(info)) = (path, metadata.old_partition_info(kind)) else {
        return Ok(None);
    };

    info!("Hashing old {kind} partition: {path:?}");

    let file = File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;
    let hash = performer::hash_partition(&file, info.size(), terminator.cancel_signal())
        .with_context(|| format!("Failed to hash old {kind} partition: {path:?}"))?;

    Ok(Some(hash))
}

/// The payload byte ranges to feed to the engine.
fn input_ranges(resume_point: Option<ResumePoint>, payload_size: u64) -> Vec<Range<u64>> {
    match resume_point {
        Some(p) => vec![
            0..p.metadata_size,
            p.payload_offset().min(payload_size)..payload_size,
        ],
        None => vec![0..payload_size],
    }
}

pub fn apply_main(cli: &ApplyCli, terminator: &Arc<Terminator>) -> Result<()> {
    let config = match &cli.config {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };

    let chunk_size = cli.chunk_size.unwrap_or(config.chunk_size);
    if chunk_size == 0 {
        bail!("Chunk size must not be zero");
    }

    let payload_file = File::open(&cli.payload)
        .with_context(|| format!("Failed to open payload: {:?}", cli.payload))?;
    let payload_size = match cli.payload_size {
        Some(s) => s,
        None => payload_file
            .file_len()
            .with_context(|| format!("Failed to get file size: {:?}", cli.payload))?,
    };
    let payload_hash = match &cli.payload_hash {
        Some(h) => h.0.clone(),
        None => {
            info!("Hashing payload: {:?}", cli.payload);

            performer::hash_partition(&payload_file, payload_size, terminator.cancel_signal())
                .with_context(|| format!("Failed to hash payload: {:?}", cli.payload))?
        }
    };

    let metadata = payload::read_metadata(BufReader::new(&payload_file))
        .with_context(|| format!("Failed to read payload metadata: {:?}", cli.payload))?;

    let prefs_dir = cli.prefs_dir.as_deref().or(config.prefs_dir.as_deref());
    let mut prefs = open_prefs(prefs_dir);

    let resume_point = if cli.resume
        && DeltaPerformer::can_resume_update_with_limit(
            &*prefs,
            &payload_hash,
            config.max_resumed_update_failures,
        ) {
        DeltaPerformer::resume_point(&*prefs).context("Failed to read update progress")?
    } else {
        None
    };

    let (source_rootfs_hash, source_kernel_hash) = if resume_point.is_some() {
        // The partitions were already partially updated.
        (None, None)
    } else {
        DeltaPerformer::reset_update_progress(&mut *prefs, false)
            .context("Failed to reset update progress")?;

        (
            source_hash(
                PartitionKind::Rootfs,
                cli.rootfs.as_deref(),
                &metadata,
                terminator,
            )?,
            source_hash(
                PartitionKind::Kernel,
                cli.kernel.as_deref(),
                &metadata,
                terminator,
            )?,
        )
    };

    let public_key = cli
        .public_key
        .as_deref()
        .or(config.public_key.as_deref())
        .map(|p| {
            crypto::read_pem_public_key_file(p)
                .with_context(|| format!("Failed to load public key: {p:?}"))
        })
        .transpose()?;
    let metadata_signature = cli
        .metadata_signature
        .as_ref()
        .map(|p| {
            fs::read(p).with_context(|| format!("Failed to read metadata signature: {p:?}"))
        })
        .transpose()?;

    let plan = InstallPlan {
        payload_hash: payload_hash.clone(),
        metadata_signature,
        source_rootfs_hash,
        source_kernel_hash,
        hash_checks_mandatory: cli.hash_checks_mandatory || config.hash_checks_mandatory,
    };
    let options = ApplyOptions {
        bspatch: Bspatch::new(cli.bspatch.as_deref().unwrap_or(&config.bspatch_path)),
        public_key,
        enforce_metadata_signature: cli.enforce_metadata_signature
            || config.enforce_metadata_signature,
        terminator: terminator.clone(),
    };

    let mut performer = DeltaPerformer::new(&mut *prefs, plan, options);

    for (kind, path) in [
        (PartitionKind::Rootfs, &cli.rootfs),
        (PartitionKind::Kernel, &cli.kernel),
    ] {
        if let Some(path) = path {
            let partition = Partition::open(path)
                .with_context(|| format!("Failed to open {kind} partition: {path:?}"))?;
            performer.set_partition(kind, partition);
        }
    }

    let mut buf = vec![0u8; chunk_size];

    for range in input_ranges(resume_point, payload_size) {
        let mut offset = range.start;

        while offset < range.end {
            if terminator.should_exit() {
                bail!("Interrupted at payload offset {offset}; progress was saved");
            }

            let n = (range.end - offset).min(buf.len() as u64) as usize;

            payload_file
                .read_exact_at(&mut buf[..n], offset)
                .with_context(|| format!("Failed to read payload at offset {offset}"))?;

            performer.write(&buf[..n]).map_err(|e| {
                let category = e.category();
                anyhow::Error::new(e).context(format!(
                    "Failed to apply payload data at offset {offset} ({category:?})"
                ))
            })?;

            offset += n as u64;
        }
    }

    performer.close().context("Failed to finish writing payload")?;
    performer
        .verify_payload(&payload_hash, payload_size)
        .context("Failed to verify payload")?;
    performer
        .verify_target_partitions()
        .context("Failed to verify updated partitions")?;

    info!(
        "Successfully applied {:?} payload with {} operations",
        NumBytes(payload_size),
        performer.total_operations(),
    );

    Ok(())
}

/// Apply a payload to partition images in place.
///
/// The images are modified directly. If --prefs-dir is specified, progress is
/// saved after every operation and an interrupted update can be continued
/// with --resume.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Path to payload.
    #[arg(short, long, alias = "apply_delta", value_name = "FILE", value_parser)]
    payload: PathBuf,

    /// Path to rootfs image to update.
    #[arg(long, alias = "old_image", value_name = "FILE", value_parser)]
    rootfs: Option<PathBuf>,

    /// Path to kernel image to update.
    #[arg(long, alias = "old_kernel", value_name = "FILE", value_parser)]
    kernel: Option<PathBuf>,

    /// Directory for storing update progress.
    #[arg(long, value_name = "DIR", value_parser)]
    prefs_dir: Option<PathBuf>,

    /// Path to config TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    config: Option<PathBuf>,

    /// Path to public key for verifying the payload signatures.
    #[arg(long, value_name = "FILE", value_parser)]
    public_key: Option<PathBuf>,

    /// Path to the metadata signature.
    #[arg(long, value_name = "FILE", value_parser)]
    metadata_signature: Option<PathBuf>,

    /// Expected SHA-256 digest of the payload (hex).
    ///
    /// If unspecified, the payload file is hashed.
    #[arg(long, value_name = "HEX", value_parser)]
    payload_hash: Option<HexBytes>,

    /// Expected size of the payload.
    #[arg(long, value_name = "BYTES", value_parser)]
    payload_size: Option<u64>,

    /// Path to bspatch executable.
    #[arg(long, value_name = "PROGRAM", value_parser)]
    bspatch: Option<PathBuf>,

    /// Number of bytes to pass to the engine at a time.
    #[arg(long, value_name = "BYTES", value_parser)]
    chunk_size: Option<usize>,

    /// Continue from the saved progress if possible.
    #[arg(long)]
    resume: bool,

    /// Fail if an operation blob has no hash.
    #[arg(long)]
    hash_checks_mandatory: bool,

    /// Fail if the metadata signature is missing or invalid.
    #[arg(long)]
    enforce_metadata_signature: bool,
}
