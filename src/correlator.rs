use tokio::time;

use crate::error::HarnessError;
use crate::message::{MethodInvocation, MethodResponse};
use crate::transport::ServiceClient;

/// Issues device method calls and waits for their single answer
///
/// `invoke` takes `&mut self`, so a correlator never has more than one call
/// outstanding.
#[derive(Debug)]
pub struct InvocationCorrelator<S> {
    client: S,
}

impl<S: ServiceClient> InvocationCorrelator<S> {
    ///
    pub fn new(client: S) -> Self {
        Self { client }
    }

    /// Invoke `invocation` on `device_id` and wait at most `invocation.timeout`.
    ///
    /// Returns the device's status and payload verbatim. A collaborator failure is a
    /// [`HarnessError::Transport`], no answer in time is a [`HarnessError::Timeout`].
    pub async fn invoke(
        &mut self,
        device_id: &str,
        invocation: &MethodInvocation,
    ) -> crate::Result<MethodResponse> {
        debug!(
            "Invoking {} on {} ({} bytes, timeout {:?})",
            invocation.method_name,
            device_id,
            invocation.payload.len(),
            invocation.timeout
        );

        let response = time::timeout(
            invocation.timeout,
            self.client.invoke_method(device_id, invocation),
        )
        .await
        .map_err(|_| HarnessError::Timeout {
            operation: "device method response",
            after: invocation.timeout,
        })??;

        info!(
            "Method {} on {} answered with status {}",
            invocation.method_name, device_id, response.status
        );
        Ok(response)
    }

    /// Release the service client
    pub async fn destroy(&self) {
        self.client.destroy().await;
    }
}

/// Fail unless the response carries `expected` status
pub fn expect_status(response: &MethodResponse, expected: i32) -> crate::Result<()> {
    if response.status != expected {
        return Err(HarnessError::ValidationMismatch(format!(
            "response status is incorrect - expected {} but got {}",
            expected, response.status
        )));
    }
    Ok(())
}

/// Fail unless the response is a 200 echoing `expected` byte for byte
pub fn expect_echo(response: &MethodResponse, expected: &[u8]) -> crate::Result<()> {
    expect_status(response, crate::responder::METHOD_RESPONSE_SUCCESS)?;

    let actual = response.payload_bytes();
    if actual.len() != expected.len() {
        return Err(HarnessError::ValidationMismatch(format!(
            "response size is incorrect - expected {} but got {}",
            expected.len(),
            actual.len()
        )));
    }
    if actual != expected {
        return Err(HarnessError::ValidationMismatch(
            "response string does not match".into(),
        ));
    }
    Ok(())
}
