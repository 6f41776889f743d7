// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{ffi::OsString, fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser};
use tracing::info;

use crate::{
    crypto::{self, PassphraseSource},
    format::payload::{DEFAULT_CHUNK_BLOCKS, PartitionKind, PayloadBuilder},
    util::NumBytes,
};

#[derive(Debug, Args)]
pub struct KeyGroup {
    /// Path to private key for signing the payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub key: Option<PathBuf>,

    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass", requires = "key")]
    pub pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass", requires = "key")]
    pub pass_file: Option<PathBuf>,
}

pub fn generate_main(cli: &GenerateCli) -> Result<()> {
    let private_key = cli
        .key
        .key
        .as_ref()
        .map(|p| {
            let source =
                PassphraseSource::new(cli.key.pass_file.as_deref(), cli.key.pass_env_var.as_deref());

            crypto::read_pem_key_file(p, &source).with_context(|| format!("Failed to load key: {p:?}"))
        })
        .transpose()?;

    let mut builder = PayloadBuilder::new(cli.block_size);

    for (kind, path) in [
        (PartitionKind::Rootfs, &cli.rootfs),
        (PartitionKind::Kernel, &cli.kernel),
    ] {
        let Some(path) = path else {
            continue;
        };

        let image = fs::read(path).with_context(|| format!("Failed to read {kind} image: {path:?}"))?;

        info!("Adding {kind} image: {path:?} ({:?})", NumBytes(image.len()));

        builder
            .add_full_image(kind, &image, cli.chunk_blocks, !cli.no_compress)
            .with_context(|| format!("Failed to add {kind} image: {path:?}"))?;
    }

    let payload = builder
        .build(private_key.as_ref())
        .context("Failed to build payload")?;

    fs::write(&cli.output, &payload.data)
        .with_context(|| format!("Failed to write payload: {:?}", cli.output))?;

    if let (Some(path), Some(signature)) = (&cli.output_metadata_signature, &payload.metadata_signature)
    {
        fs::write(path, signature)
            .with_context(|| format!("Failed to write metadata signature: {path:?}"))?;
    }

    info!(
        "Wrote {:?} payload with metadata size {}",
        NumBytes(payload.data.len()),
        payload.metadata_size,
    );

    println!("{}", hex::encode(payload.hash));

    Ok(())
}

/// Generate a full payload from partition images.
///
/// Each image is split into chunks that are stored compressed with bzip2 when
/// that makes them smaller. The SHA-256 digest of the payload is printed to
/// stdout.
#[derive(Debug, Parser)]
pub struct GenerateCli {
    /// Path to output payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to new rootfs image.
    #[arg(long, value_name = "FILE", value_parser, required_unless_present = "kernel")]
    rootfs: Option<PathBuf>,

    /// Path to new kernel image.
    #[arg(long, value_name = "FILE", value_parser)]
    kernel: Option<PathBuf>,

    #[command(flatten)]
    key: KeyGroup,

    /// Path to output metadata signature.
    #[arg(long, value_name = "FILE", value_parser, requires = "key")]
    output_metadata_signature: Option<PathBuf>,

    /// Block size of the partitions.
    #[arg(long, value_name = "BYTES", default_value_t = 4096)]
    block_size: u32,

    /// Number of blocks per operation.
    #[arg(long, value_name = "BLOCKS", default_value_t = DEFAULT_CHUNK_BLOCKS)]
    chunk_blocks: u64,

    /// Store all chunks uncompressed.
    #[arg(long)]
    no_compress: bool,
}
