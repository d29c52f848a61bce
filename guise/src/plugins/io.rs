// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Literal cover-protocol traffic on the physical connection
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::protocol::{
  action::{str_arg, Action, ActionError},
  FsmContext, Value,
};

/// `io.puts(text)`: writes `text` to the connection
pub struct Puts;

impl Action for Puts {
  fn invoke<'a>(
    &'a self,
    ctx: &'a mut dyn FsmContext,
    args: &'a [Value],
  ) -> BoxFuture<'a, Result<(), ActionError>> {
    async move {
      let text = str_arg(args, 0)?;
      let conn = ctx.conn();
      conn.write_all(text.as_bytes()).await?;
      conn.flush().await?;
      Ok(())
    }
    .boxed()
  }
}

/// `io.gets(text)`: reads exactly as many bytes as `text` holds and declines
/// the transition if they differ.
///
/// The bytes are consumed either way; alternative transitions see what follows.
pub struct Gets;

impl Action for Gets {
  fn invoke<'a>(
    &'a self,
    ctx: &'a mut dyn FsmContext,
    args: &'a [Value],
  ) -> BoxFuture<'a, Result<(), ActionError>> {
    async move {
      let expected = str_arg(args, 0)?;
      let mut received = vec![0u8; expected.len()];
      ctx.conn().read_exact(&mut received).await?;
      if received != expected.as_bytes() {
        return Err(ActionError::Declined(format!(
          "expected {:?}, received {:?}",
          expected,
          String::from_utf8_lossy(&received)
        )));
      }
      Ok(())
    }
    .boxed()
  }
}
