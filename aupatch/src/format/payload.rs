// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Cursor, Read, Write},
};

use bzip2::write::BzEncoder;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use prost::Message;
use ring::digest::{SHA256, digest};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

use crate::{
    crypto,
    format::extent::{self, SPARSE_HOLE, new_extent},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallOperation, PartitionInfo, Signatures,
        install_operation::Type,
        signatures::Signature,
    },
    stream::{ReadBigEndianExt, ReadFixedSizeExt, WriteBigEndianExt},
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
pub const PAYLOAD_VERSION: u64 = 1;

/// Offset of the manifest size field.
pub const MANIFEST_SIZE_OFFSET: usize = PAYLOAD_MAGIC.len() + 8;
/// Offset of the manifest itself. This is also the minimum metadata size.
pub const MANIFEST_OFFSET: usize = MANIFEST_SIZE_OFFSET + 8;

/// Default number of blocks per operation for full payloads.
pub const DEFAULT_CHUNK_BLOCKS: u64 = 256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload magic: {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("Manifest size too large: {0}")]
    ManifestTooLarge(u64),
    #[error("Failed to decompress manifest")]
    ManifestDecompress(#[source] io::Error),
    #[error("Failed to parse manifest")]
    ManifestParse(#[source] prost::DecodeError),
    #[error("Failed to parse signatures")]
    SignaturesParse(#[source] prost::DecodeError),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),
    #[error("Signature blob size {size} does not fit in a {block_size} byte block")]
    SignatureTooLarge { size: usize, block_size: u32 },
    #[error("Expected signature blob of {expected} bytes, but have {actual} bytes")]
    SignatureSizeMismatch { expected: usize, actual: usize },
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Extent error")]
    Extent(#[from] extent::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The partition an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionKind {
    Rootfs,
    Kernel,
}

impl PartitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rootfs => "rootfs",
            Self::Kernel => "kernel",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The header and manifest of a payload.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadMetadata {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    /// Size of the header plus the compressed manifest. Blob offsets are
    /// relative to this.
    pub metadata_size: u64,
}

impl PayloadMetadata {
    pub fn block_size(&self) -> u32 {
        self.manifest.block_size()
    }

    pub fn total_operations(&self) -> usize {
        self.manifest.install_operations.len() + self.manifest.kernel_install_operations.len()
    }

    /// Look up an operation by its index in the combined sequence. Rootfs
    /// operations come first.
    pub fn operation(&self, index: usize) -> Option<(PartitionKind, &InstallOperation)> {
        let rootfs = &self.manifest.install_operations;

        if index < rootfs.len() {
            Some((PartitionKind::Rootfs, &rootfs[index]))
        } else {
            self.manifest
                .kernel_install_operations
                .get(index - rootfs.len())
                .map(|op| (PartitionKind::Kernel, op))
        }
    }

    pub fn old_partition_info(&self, kind: PartitionKind) -> Option<&PartitionInfo> {
        match kind {
            PartitionKind::Rootfs => self.manifest.old_rootfs_info.as_ref(),
            PartitionKind::Kernel => self.manifest.old_kernel_info.as_ref(),
        }
    }

    pub fn new_partition_info(&self, kind: PartitionKind) -> Option<&PartitionInfo> {
        match kind {
            PartitionKind::Rootfs => self.manifest.new_rootfs_info.as_ref(),
            PartitionKind::Kernel => self.manifest.new_kernel_info.as_ref(),
        }
    }

    /// Total size of all operation blobs.
    pub fn blob_size(&self) -> u64 {
        self.manifest
            .install_operations
            .iter()
            .chain(&self.manifest.kernel_install_operations)
            .filter(|op| op.data_length.is_some())
            .map(|op| op.data_offset() + op.data_length())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParseStatus {
    InsufficientData,
    Complete(PayloadMetadata),
}

/// Attempt to parse the payload metadata from the start of `data`. This never
/// looks at bytes past the metadata.
pub fn parse_metadata(data: &[u8]) -> Result<ParseStatus> {
    if data.len() < MANIFEST_OFFSET {
        return Ok(ParseStatus::InsufficientData);
    }

    let mut reader = Cursor::new(data);

    let magic = reader.read_array_exact::<4>()?;
    if magic != *PAYLOAD_MAGIC {
        return Err(Error::InvalidMagic(magic));
    }

    // Unknown versions are not rejected.
    let version = reader.read_u64_be()?;
    let manifest_size = reader.read_u64_be()?;

    let metadata_size = manifest_size
        .checked_add(MANIFEST_OFFSET as u64)
        .filter(|&s| usize::try_from(s).is_ok())
        .ok_or(Error::ManifestTooLarge(manifest_size))?;

    if (data.len() as u64) < metadata_size {
        return Ok(ParseStatus::InsufficientData);
    }

    let manifest = decompress_manifest(&data[MANIFEST_OFFSET..metadata_size as usize])?;

    Ok(ParseStatus::Complete(PayloadMetadata {
        version,
        manifest,
        metadata_size,
    }))
}

/// Read the payload metadata from the start of a stream, leaving the stream
/// positioned at the first blob.
pub fn read_metadata(mut reader: impl Read) -> Result<PayloadMetadata> {
    let mut data = reader.read_vec_exact(MANIFEST_OFFSET)?;
    let manifest_size = Cursor::new(&data[MANIFEST_SIZE_OFFSET..]).read_u64_be()?;
    let manifest_size =
        usize::try_from(manifest_size).map_err(|_| Error::ManifestTooLarge(manifest_size))?;

    data.extend(reader.read_vec_exact(manifest_size)?);

    match parse_metadata(&data)? {
        ParseStatus::Complete(metadata) => Ok(metadata),
        ParseStatus::InsufficientData => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

pub fn decompress_manifest(data: &[u8]) -> Result<DeltaArchiveManifest> {
    let mut raw = vec![];
    GzDecoder::new(data)
        .read_to_end(&mut raw)
        .map_err(Error::ManifestDecompress)?;

    DeltaArchiveManifest::decode(raw.as_slice()).map_err(Error::ManifestParse)
}

pub fn compress_manifest(manifest: &DeltaArchiveManifest) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(vec![], Compression::best());
    encoder.write_all(&manifest.encode_to_vec())?;

    Ok(encoder.finish()?)
}

pub fn parse_signatures(data: &[u8]) -> Result<Signatures> {
    Signatures::decode(data).map_err(Error::SignaturesParse)
}

/// Verify a serialized [`Signatures`] message against the SHA-256 digest of
/// the metadata bytes.
pub fn verify_metadata_signature(
    metadata: &[u8],
    signature_blob: &[u8],
    key: &RsaPublicKey,
) -> Result<()> {
    let signatures = parse_signatures(signature_blob)?;
    let digest = digest(&SHA256, metadata);

    crypto::verify_digest(digest.as_ref(), &signatures, key)?;

    Ok(())
}

/// Size and SHA-256 digest of a partition image.
pub fn partition_info(data: &[u8]) -> PartitionInfo {
    PartitionInfo {
        size: Some(data.len() as u64),
        hash: Some(digest(&SHA256, data).as_ref().to_vec()),
    }
}

/// Split an image into REPLACE_BZ operations of `chunk_blocks` blocks each.
/// Chunks that do not shrink when compressed are stored as plain REPLACE.
pub fn full_operations(
    image: &[u8],
    block_size: u32,
    chunk_blocks: u64,
    compress: bool,
) -> Result<Vec<(InstallOperation, Vec<u8>)>> {
    if block_size == 0 {
        return Err(Error::InvalidBlockSize(block_size));
    }

    let chunk_size = chunk_blocks.max(1) * u64::from(block_size);
    let mut result = vec![];

    for (i, chunk) in image.chunks(chunk_size as usize).enumerate() {
        let start_block = i as u64 * chunk_blocks.max(1);
        let num_blocks = (chunk.len() as u64).div_ceil(u64::from(block_size));

        let mut op = InstallOperation {
            dst_extents: vec![new_extent(start_block, num_blocks)],
            dst_length: Some(chunk.len() as u64),
            ..Default::default()
        };

        let mut data = chunk.to_vec();

        if compress {
            let mut encoder = BzEncoder::new(vec![], bzip2::Compression::best());
            encoder.write_all(chunk)?;
            let compressed = encoder.finish()?;

            if compressed.len() < chunk.len() {
                data = compressed;
                op.set_type(Type::ReplaceBz);
            } else {
                op.set_type(Type::Replace);
            }
        } else {
            op.set_type(Type::Replace);
        }

        result.push((op, data));
    }

    Ok(result)
}

/// A complete payload produced by [`PayloadBuilder`].
pub struct Payload {
    pub data: Vec<u8>,
    pub metadata_size: u64,
    /// SHA-256 of the entire payload.
    pub hash: [u8; 32],
    /// Serialized [`Signatures`] of the metadata, if a key was given.
    pub metadata_signature: Option<Vec<u8>>,
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("size", &self.data.len())
            .field("metadata_size", &self.metadata_size)
            .field("hash", &hex::encode(self.hash))
            .field("metadata_signature", &self.metadata_signature.is_some())
            .finish()
    }
}

/// Assembles a payload from operations and their blobs.
#[derive(Clone, Debug)]
pub struct PayloadBuilder {
    manifest: DeltaArchiveManifest,
    blobs: Vec<u8>,
    operation_hashes: bool,
}

impl PayloadBuilder {
    pub fn new(block_size: u32) -> Self {
        Self {
            manifest: DeltaArchiveManifest {
                block_size: Some(block_size),
                ..Default::default()
            },
            blobs: vec![],
            operation_hashes: true,
        }
    }

    /// Whether to record the SHA-256 of each operation blob. Enabled by
    /// default.
    pub fn set_operation_hashes(&mut self, enabled: bool) {
        self.operation_hashes = enabled;
    }

    pub fn set_partition_info(
        &mut self,
        kind: PartitionKind,
        old: Option<PartitionInfo>,
        new: Option<PartitionInfo>,
    ) {
        match kind {
            PartitionKind::Rootfs => {
                self.manifest.old_rootfs_info = old;
                self.manifest.new_rootfs_info = new;
            }
            PartitionKind::Kernel => {
                self.manifest.old_kernel_info = old;
                self.manifest.new_kernel_info = new;
            }
        }
    }

    /// Append an operation. If `data` is not empty, it is appended to the blob
    /// section and the operation's data offset and length are filled in,
    /// along with the hash if enabled.
    pub fn add_operation(&mut self, kind: PartitionKind, mut op: InstallOperation, data: &[u8]) {
        if !data.is_empty() {
            op.data_offset = Some(self.blobs.len() as u64);
            op.data_length = Some(data.len() as u64);
            if self.operation_hashes {
                op.data_sha256_hash = Some(digest(&SHA256, data).as_ref().to_vec());
            }

            self.blobs.extend_from_slice(data);
        }

        match kind {
            PartitionKind::Rootfs => self.manifest.install_operations.push(op),
            PartitionKind::Kernel => self.manifest.kernel_install_operations.push(op),
        }
    }

    /// Add operations that write `image` in full and record its partition
    /// info.
    pub fn add_full_image(
        &mut self,
        kind: PartitionKind,
        image: &[u8],
        chunk_blocks: u64,
        compress: bool,
    ) -> Result<()> {
        for (op, data) in full_operations(image, self.manifest.block_size(), chunk_blocks, compress)?
        {
            self.add_operation(kind, op, &data);
        }

        self.set_partition_info(kind, None, Some(partition_info(image)));

        Ok(())
    }

    /// Serialize the payload. If `key` is specified, the payload is signed by
    /// appending a signature operation whose blob holds the signature of
    /// everything before it.
    pub fn build(self, key: Option<&RsaPrivateKey>) -> Result<Payload> {
        let block_size = self.manifest.block_size();
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        let mut manifest = self.manifest;
        let mut data = vec![];

        let signature_size = if let Some(key) = key {
            let dummy = Signatures {
                signatures: vec![Signature {
                    version: Some(crypto::SIGNATURE_VERSION),
                    data: Some(vec![0u8; crypto::signature_size(key)]),
                }],
            };
            let size = dummy.encoded_len();

            if size > block_size as usize {
                return Err(Error::SignatureTooLarge { size, block_size });
            }

            let offset = self.blobs.len() as u64;
            manifest.signatures_offset = Some(offset);
            manifest.signatures_size = Some(size as u64);

            let mut op = InstallOperation {
                data_offset: Some(offset),
                data_length: Some(size as u64),
                dst_extents: vec![new_extent(SPARSE_HOLE, 1)],
                ..Default::default()
            };
            op.set_type(Type::Replace);

            // The signature must be the last blob, so it goes at the end of
            // the last non-empty operation list.
            if manifest.kernel_install_operations.is_empty() {
                manifest.install_operations.push(op);
            } else {
                manifest.kernel_install_operations.push(op);
            }

            Some(size)
        } else {
            None
        };

        let manifest_raw = compress_manifest(&manifest)?;

        data.extend_from_slice(PAYLOAD_MAGIC);
        data.write_u64_be(PAYLOAD_VERSION)?;
        data.write_u64_be(manifest_raw.len() as u64)?;
        data.extend_from_slice(&manifest_raw);

        let metadata_size = data.len();

        data.extend_from_slice(&self.blobs);

        let mut metadata_signature = None;

        if let (Some(key), Some(expected)) = (key, signature_size) {
            let payload_digest = digest(&SHA256, &data);
            let signatures = crypto::sign_digest(payload_digest.as_ref(), key)?.encode_to_vec();

            if signatures.len() != expected {
                return Err(Error::SignatureSizeMismatch {
                    expected,
                    actual: signatures.len(),
                });
            }

            data.extend_from_slice(&signatures);

            let metadata_digest = digest(&SHA256, &data[..metadata_size]);
            metadata_signature =
                Some(crypto::sign_digest(metadata_digest.as_ref(), key)?.encode_to_vec());
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(digest(&SHA256, &data).as_ref());

        Ok(Payload {
            data,
            metadata_size: metadata_size as u64,
            hash,
            metadata_signature,
        })
    }
}
