//! Two-step ownership transfer with a remotely signed device certificate.
//!
//! The transfer runs in its own task under a deadline. When the device emits
//! its certificate request, the request is handed back to the caller and the
//! task parks until the signed chain arrives through
//! [`PendingOwnership::finish`]. Dropping a [`PendingOwnership`] aborts the
//! transfer, so an expired or cleared state never completes later.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use shared::{
    error::{GatewayError, GatewayResult, StatusCode, TransportError},
    types::DeviceId,
};

use crate::transport::{CertificateSigner, TransportResult};

fn cancelled() -> TransportError {
    TransportError::Io("remote signing cancelled".into())
}

fn aborted(device_id: DeviceId) -> GatewayError {
    GatewayError::from_transport(
        StatusCode::Unavailable,
        format!("cannot own device {device_id}"),
        cancelled(),
    )
}

/// Signer handed to the transfer: forwards the CSR, then waits for the chain
#[derive(Debug)]
struct ChannelSigner {
    csr: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    certificate: Mutex<Option<oneshot::Receiver<Vec<u8>>>>,
}

#[async_trait]
impl CertificateSigner for ChannelSigner {
    async fn sign(&self, csr: Vec<u8>) -> TransportResult<Vec<u8>> {
        let sender = self.csr.lock().take();
        let receiver = self.certificate.lock().take();
        let (Some(sender), Some(receiver)) = (sender, receiver) else {
            return Err(TransportError::Io("certificate request already signed".into()));
        };
        sender.send(csr).map_err(|_| cancelled())?;
        receiver.await.map_err(|_| cancelled())
    }
}

/// Transfer waiting for its signed device certificate
pub struct PendingOwnership {
    device_id: DeviceId,
    certificate: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    outcome: Mutex<Option<oneshot::Receiver<GatewayResult<()>>>>,
    task: AbortHandle,
}

impl PendingOwnership {
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Hand the signed chain to the transfer and wait for its outcome
    pub async fn finish(&self, certificate_pem: Vec<u8>) -> GatewayResult<()> {
        let sender = self.certificate.lock().take();
        let outcome = self.outcome.lock().take();
        let (Some(sender), Some(outcome)) = (sender, outcome) else {
            return Err(GatewayError::InvalidState);
        };
        if sender.send(certificate_pem).is_err() {
            debug!(device_id = %self.device_id, "Transfer ended before the certificate arrived");
        }
        outcome
            .await
            .unwrap_or_else(|_| Err(aborted(self.device_id)))
    }
}

impl Drop for PendingOwnership {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// First step of a remotely signed transfer
pub enum RemoteSignStart {
    /// The device asked for a certificate; finish with the signed chain
    Pending {
        csr: Vec<u8>,
        ownership: PendingOwnership,
    },
    /// The transfer completed without a certificate request
    Completed,
}

/// Spawn `transfer` with a signer that surfaces the device's certificate
/// request. The whole transfer, including the wait for the signed chain,
/// must end within `timeout`.
pub async fn start_remote_sign<F, Fut>(
    device_id: DeviceId,
    timeout: Duration,
    transfer: F,
) -> GatewayResult<RemoteSignStart>
where
    F: FnOnce(Arc<dyn CertificateSigner>) -> Fut,
    Fut: Future<Output = GatewayResult<()>> + Send + 'static,
{
    let (csr_tx, csr_rx) = oneshot::channel();
    let (certificate_tx, certificate_rx) = oneshot::channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let signer: Arc<dyn CertificateSigner> = Arc::new(ChannelSigner {
        csr: Mutex::new(Some(csr_tx)),
        certificate: Mutex::new(Some(certificate_rx)),
    });

    let transfer = transfer(signer);
    let task = tokio::spawn(async move {
        let result = match tokio::time::timeout(timeout, transfer).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::from_transport(
                StatusCode::Unavailable,
                format!("cannot own device {device_id}"),
                TransportError::Timeout,
            )),
        };
        if let Err(e) = &result {
            debug!(device_id = %device_id, error = %e, "Remotely signed transfer failed");
        }
        if outcome_tx.send(result).is_err() {
            debug!(device_id = %device_id, "Transfer outcome dropped");
        }
    });

    match csr_rx.await {
        Ok(csr) => {
            info!(device_id = %device_id, timeout = ?timeout, "Waiting for signed device certificate");
            Ok(RemoteSignStart::Pending {
                csr,
                ownership: PendingOwnership {
                    device_id,
                    certificate: Mutex::new(Some(certificate_tx)),
                    outcome: Mutex::new(Some(outcome_rx)),
                    task: task.abort_handle(),
                },
            })
        }
        // the signer was dropped: the transfer ended on its own
        Err(_) => match outcome_rx.await {
            Ok(Ok(())) => Ok(RemoteSignStart::Completed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(aborted(device_id)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(start: RemoteSignStart) -> (Vec<u8>, PendingOwnership) {
        match start {
            RemoteSignStart::Pending { csr, ownership } => (csr, ownership),
            RemoteSignStart::Completed => panic!("transfer did not ask for a certificate"),
        }
    }

    #[tokio::test]
    async fn test_certificate_reaches_transfer() {
        let device = uuid::Uuid::new_v4();
        let start = start_remote_sign(device, Duration::from_secs(5), |signer| async move {
            match signer.sign(b"csr".to_vec()).await {
                Ok(chain) if chain == b"chain" => Ok(()),
                Ok(_) => Err(GatewayError::InvalidCertificate("unexpected chain".into())),
                Err(e) => Err(GatewayError::from_transport(StatusCode::Unavailable, "sign", e)),
            }
        })
        .await
        .unwrap();

        let (csr, ownership) = pending(start);
        assert_eq!(csr, b"csr");
        assert_eq!(ownership.device_id(), device);
        ownership.finish(b"chain".to_vec()).await.unwrap();

        // a state finishes once
        let err = ownership.finish(b"chain".to_vec()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState));
    }

    #[tokio::test]
    async fn test_transfer_error_before_request() {
        let start = start_remote_sign(uuid::Uuid::new_v4(), Duration::from_secs(5), |_| async {
            Err::<(), _>(GatewayError::AuthenticationDisabled)
        })
        .await;
        assert!(matches!(start, Err(GatewayError::AuthenticationDisabled)));

        let start = start_remote_sign(uuid::Uuid::new_v4(), Duration::from_secs(5), |_| async {
            Ok::<(), GatewayError>(())
        })
        .await
        .unwrap();
        assert!(matches!(start, RemoteSignStart::Completed));
    }

    #[tokio::test]
    async fn test_dropped_state_cancels_transfer() {
        let (done_tx, done_rx) = oneshot::channel();
        let start = start_remote_sign(uuid::Uuid::new_v4(), Duration::from_secs(5), |signer| {
            async move {
                let result = signer.sign(b"csr".to_vec()).await;
                let _ = done_tx.send(result.is_err());
                Ok::<(), GatewayError>(())
            }
        })
        .await
        .unwrap();
        let (_, ownership) = pending(start);
        drop(ownership);

        // either the wait fails or the task is aborted outright
        if let Ok(failed) = done_rx.await {
            assert!(failed);
        }
    }

    #[tokio::test]
    async fn test_unsigned_transfer_times_out() {
        let start = start_remote_sign(uuid::Uuid::new_v4(), Duration::from_millis(100), |signer| {
            async move {
                signer
                    .sign(b"csr".to_vec())
                    .await
                    .map(|_| ())
                    .map_err(|e| GatewayError::from_transport(StatusCode::Unavailable, "sign", e))
            }
        })
        .await
        .unwrap();
        let (_, ownership) = pending(start);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = ownership.finish(b"late".to_vec()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::Unavailable);
    }
}
