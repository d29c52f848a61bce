// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

pub mod connection;
pub mod validators;

/// Copies between two duplex streams until both directions have finished
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_streams<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64), std::io::Error>
where
  A: AsyncRead + AsyncWrite + Unpin + ?Sized,
  B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
  match tokio::io::copy_bidirectional(a, b).await {
    Ok((a_to_b, b_to_a)) => {
      tracing::trace!(a_to_b, b_to_a, "proxy finished");
      Ok((a_to_b, b_to_a))
    }
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy copy ended with error");
      Err(e)
    }
  }
}
