// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod dropkick;
pub mod framed;
pub mod splice;
pub mod token;
pub mod tunnel_stream;

pub use splice::splice_bidirectional;
