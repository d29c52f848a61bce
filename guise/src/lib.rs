// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A programmable traffic-shaping transport
//!
//! Endpoints interpret a [Document]'s state-transition program to make an
//! application byte-stream look like some cover protocol on the wire. A
//! [server::Listener] runs one engine per accepted connection and hands out
//! the logical streams they carry; a [client::Dialer] does the reverse.

pub mod common;
pub mod stream;
pub mod util;

pub mod client;
pub mod plugins;
pub mod server;

pub use common::Document;
