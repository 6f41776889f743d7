// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{ffi::OsString, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::crypto::{self, PassphraseSource};

fn get_passphrase_source(group: &PassphraseGroup) -> PassphraseSource {
    PassphraseSource::new(group.pass_file.as_deref(), group.pass_env_var.as_deref())
}

pub fn key_main(cli: &KeyCli) -> Result<()> {
    match &cli.command {
        KeyCommand::GenerateKey(c) => {
            let private_key = crypto::generate_rsa_key_pair(c.bits.into())
                .context("Failed to generate RSA keypair")?;

            crypto::write_pem_key_file(&c.output, &private_key)
                .with_context(|| format!("Failed to write private key: {:?}", c.output))?;
        }
        KeyCommand::ExtractPublicKey(c) => {
            let source = get_passphrase_source(&c.passphrase);
            let private_key = crypto::read_pem_key_file(&c.key, &source)
                .with_context(|| format!("Failed to load key: {:?}", c.key))?;

            crypto::write_pem_public_key_file(&c.output, &private_key.to_public_key())
                .with_context(|| format!("Failed to write public key: {:?}", c.output))?;
        }
    }

    Ok(())
}

#[derive(Debug, Args)]
struct PassphraseGroup {
    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pass_file: Option<PathBuf>,
}

/// Generate an RSA keypair for signing payloads.
///
/// The output is saved unencrypted in the standard PKCS8 format.
#[derive(Debug, Parser)]
struct GenerateKeyCli {
    /// Path to output private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Key size in bits.
    #[arg(long, default_value_t = 2048, value_parser = clap::value_parser!(u16).range(2048..=8192))]
    bits: u16,
}

/// Extract the public key from a private key.
#[derive(Debug, Parser)]
struct ExtractPublicKeyCli {
    /// Path to input private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: PathBuf,

    #[command(flatten)]
    passphrase: PassphraseGroup,

    /// Path to output PKCS8-encoded public key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    GenerateKey(GenerateKeyCli),
    ExtractPublicKey(ExtractPublicKeyCli),
}

/// Generate and convert keys.
#[derive(Debug, Parser)]
pub struct KeyCli {
    #[command(subcommand)]
    command: KeyCommand,
}
