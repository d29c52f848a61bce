// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod document;
pub mod protocol;
pub mod transport;

pub use document::Document;
