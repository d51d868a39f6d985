// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Random credentials for tether passwords and SOCKS5 users

use base64::Engine;
use rand::RngCore;

/// Length, in random bytes, of tokens produced when no length is requested
pub const DEFAULT_TOKEN_BYTES: usize = 24;

/// Generates `byte_length` random bytes and encodes them as unpadded URL-safe base64
pub fn generate_token(byte_length: usize) -> String {
  let mut bytes = vec![0u8; byte_length];
  rand::thread_rng().fill_bytes(&mut bytes);
  base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
