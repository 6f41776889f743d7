// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fs::File, io::BufReader, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use crate::{
    format::{
        extent,
        payload::{self, PartitionKind, PayloadMetadata},
    },
    protobuf::{
        chromeos_update_engine::{InstallOperation, PartitionInfo},
        operation_type,
    },
    stream::FileLen,
};

#[derive(Serialize)]
struct PartitionInfoSummary {
    size: u64,
    #[serde(serialize_with = "hex::serialize")]
    hash: Vec<u8>,
}

impl From<&PartitionInfo> for PartitionInfoSummary {
    fn from(value: &PartitionInfo) -> Self {
        Self {
            size: value.size(),
            hash: value.hash().to_vec(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct OperationSummary {
    #[serde(rename = "type", with = "operation_type")]
    op_type: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_length: Option<u64>,
    src_extents: String,
    dst_extents: String,
}

impl From<&InstallOperation> for OperationSummary {
    fn from(value: &InstallOperation) -> Self {
        Self {
            op_type: value.r#type,
            data_offset: value.data_offset,
            data_length: value.data_length,
            src_extents: extent::extents_to_string(&value.src_extents),
            dst_extents: extent::extents_to_string(&value.dst_extents),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct PartitionSummary {
    operation_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    old: Option<PartitionInfoSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new: Option<PartitionInfoSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    operations: Vec<OperationSummary>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct PayloadSummary {
    version: u64,
    payload_size: u64,
    metadata_size: u64,
    block_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    signatures_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signatures_size: Option<u64>,
    partitions: BTreeMap<&'static str, PartitionSummary>,
}

fn summarize(metadata: &PayloadMetadata, payload_size: u64, with_operations: bool) -> PayloadSummary {
    let manifest = &metadata.manifest;
    let mut partitions = BTreeMap::new();

    for (kind, ops) in [
        (PartitionKind::Rootfs, &manifest.install_operations),
        (PartitionKind::Kernel, &manifest.kernel_install_operations),
    ] {
        let old = metadata.old_partition_info(kind);
        let new = metadata.new_partition_info(kind);

        if ops.is_empty() && old.is_none() && new.is_none() {
            continue;
        }

        partitions.insert(
            kind.as_str(),
            PartitionSummary {
                operation_count: ops.len(),
                old: old.map(Into::into),
                new: new.map(Into::into),
                operations: if with_operations {
                    ops.iter().map(Into::into).collect()
                } else {
                    vec![]
                },
            },
        );
    }

    PayloadSummary {
        version: metadata.version,
        payload_size,
        metadata_size: metadata.metadata_size,
        block_size: metadata.block_size(),
        signatures_offset: manifest.signatures_offset,
        signatures_size: manifest.signatures_size,
        partitions,
    }
}

pub fn info_main(cli: &InfoCli) -> Result<()> {
    let file = File::open(&cli.input)
        .with_context(|| format!("Failed to open payload: {:?}", cli.input))?;
    let payload_size = file
        .file_len()
        .with_context(|| format!("Failed to get file size: {:?}", cli.input))?;
    let metadata = payload::read_metadata(BufReader::new(&file))
        .with_context(|| format!("Failed to read payload metadata: {:?}", cli.input))?;

    let summary = summarize(&metadata, payload_size, cli.operations);
    let output =
        toml_edit::ser::to_string_pretty(&summary).context("Failed to serialize payload info")?;

    print!("{output}");

    Ok(())
}

/// Display payload header and manifest information.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Also list every install operation.
    #[arg(long)]
    operations: bool,
}
