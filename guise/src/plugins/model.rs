// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;

use crate::common::protocol::{
  action::{int_arg, Action, ActionError},
  FsmContext, Value,
};

/// `model.sleep(ms)`: pauses the engine, shaping inter-message timing
pub struct Sleep;

impl Action for Sleep {
  fn invoke<'a>(
    &'a self,
    _ctx: &'a mut dyn FsmContext,
    args: &'a [Value],
  ) -> BoxFuture<'a, Result<(), ActionError>> {
    async move {
      let millis = u64::try_from(int_arg(args, 0)?).map_err(|_| ActionError::InvalidArgumentType)?;
      tokio::time::sleep(Duration::from_millis(millis)).await;
      Ok(())
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::Sleep;
  use crate::common::protocol::{fsm::context::MockFsmContext, Action, ActionError, Value};

  #[tokio::test(start_paused = true)]
  async fn sleeps_for_the_given_duration() {
    let mut ctx = MockFsmContext::new();
    let started = tokio::time::Instant::now();
    Sleep.invoke(&mut ctx, &[Value::Int(250)]).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
  }

  #[tokio::test]
  async fn negative_durations_are_rejected() {
    let mut ctx = MockFsmContext::new();
    assert!(matches!(
      Sleep.invoke(&mut ctx, &[Value::Int(-1)]).await,
      Err(ActionError::InvalidArgumentType)
    ));
  }
}
