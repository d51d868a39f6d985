// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::path::{Path, PathBuf};

fn with_suffix(base: &Path, suffix: &str) -> Result<PathBuf> {
  let name = base
    .file_name()
    .and_then(|name| name.to_str())
    .context("Output path must end in a UTF-8 file name")?;
  Ok(base.with_file_name(format!("{}.{}", name, suffix)))
}

/// Writes `<base>.crt` and `<base>.key`, the pair a relay listener loads by default
#[tracing::instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  use std::fs;
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  let (cert_path, key_path) = (with_suffix(&path, "crt")?, with_suffix(&path, "key")?);
  fs::write(&cert_path, &public_pem).context("Failed writing certificate")?;
  fs::write(&key_path, &private_pem).context("Failed writing private key")?;
  tracing::info!(cert = ?cert_path, key = ?key_path, "certificate written");
  Ok(())
}
