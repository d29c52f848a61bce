// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{self, BoxFuture, FutureExt};

use crate::common::protocol::{
  action::{str_arg, Action, ActionError},
  FsmContext, Value,
};

/// `channel.bind(var)`: binds an ephemeral listener and stores its port in `var`.
///
/// Does nothing if `var` already holds a value, so that re-entering the
/// transition does not leak a second listener.
pub struct Bind;

impl Action for Bind {
  fn invoke<'a>(
    &'a self,
    ctx: &'a mut dyn FsmContext,
    args: &'a [Value],
  ) -> BoxFuture<'a, Result<(), ActionError>> {
    future::ready(bind(ctx, args)).boxed()
  }
}

pub fn bind(ctx: &mut dyn FsmContext, args: &[Value]) -> Result<(), ActionError> {
  let name = str_arg(args, 0)?;
  if ctx.var(name).is_some() {
    tracing::trace!(var = name, "channel already bound");
    return Ok(());
  }
  let port = ctx.listen()?;
  tracing::debug!(var = name, port, "channel bound");
  ctx.set_var(name, Value::from(port));
  Ok(())
}
