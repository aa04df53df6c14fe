use std::sync::Arc;

use tokio::sync::Mutex;

use crate::errors::HarnessError;
use crate::interlock::StateInterlock;
use crate::server::ServerSupervisor;

/// The test-facing control surface. Every operation takes the controller's
/// own lock before touching the interlock, so two test tasks can never
/// interleave their queries and commands — even though the underlying
/// lifecycle work stays asynchronous. This is a choke point on purpose: it
/// protects against situations like two clients reaching for the same
/// active server at the same time.
///
/// The controller owns no state of its own; supervisors and classification
/// both live behind the interlock.
pub struct ProcessControl {
    interlock: Arc<StateInterlock>,
    serial: Mutex<()>,
}

impl ProcessControl {
    /// Wraps the interlock in the serialization choke point.
    pub fn new(interlock: Arc<StateInterlock>) -> Self {
        Self {
            interlock,
            serial: Mutex::new(()),
        }
    }

    /// Does nothing, serially. A tracing marker for demonstration runs.
    pub async fn synchronize_client(&self) {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> synchronize_client");
        tracing::debug!("<<< synchronize_client");
    }

    /// Blocks until some server is active.
    pub async fn wait_for_active(&self) -> Result<(), HarnessError> {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> wait_for_active");
        self.interlock.wait_for_active().await?;
        tracing::debug!("<<< wait_for_active");
        Ok(())
    }

    /// Blocks until every running server has settled into a role and one of
    /// them is active.
    pub async fn wait_for_running_passives_in_standby(&self) -> Result<(), HarnessError> {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> wait_for_running_passives_in_standby");
        self.interlock.wait_for_all_ready().await?;
        tracing::debug!("<<< wait_for_running_passives_in_standby");
        Ok(())
    }

    /// Starts one terminated server and waits until it has left the
    /// terminated state. Fails when every server is already running.
    pub async fn start_one_server(&self) -> Result<(), HarnessError> {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> start_one_server");
        self.start_server().await?;
        tracing::debug!("<<< start_one_server");
        Ok(())
    }

    async fn start_server(&self) -> Result<(), HarnessError> {
        let server = self.interlock.one_terminated_server().ok_or_else(|| {
            HarnessError::Precondition("tried to start one server when none are terminated".into())
        })?;
        server.start().await?;
        // wait for it to register as running, so later ready-waits know
        // this one is expected
        self.interlock.wait_for_server_running(server.name()).await
    }

    /// Starts every terminated server, one at a time, waiting for each to
    /// register as running before picking the next.
    pub async fn start_all_servers(&self) -> Result<(), HarnessError> {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> start_all_servers");
        let mut server = self.interlock.one_terminated_server();
        while let Some(current) = server {
            current.start().await?;
            self.interlock
                .wait_for_server_running(current.name())
                .await?;
            let next = self.interlock.one_terminated_server();
            if let Some(next) = &next {
                // we just watched `current` come online, so the registry
                // cannot hand it back
                assert!(
                    !Arc::ptr_eq(&current, next),
                    "terminated-server query returned a server that is running"
                );
            }
            server = next;
        }
        tracing::debug!("<<< start_all_servers");
        Ok(())
    }

    /// Stops the active server and waits for its termination. Fails when no
    /// server is active.
    pub async fn terminate_active(&self) -> Result<(), HarnessError> {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> terminate_active");
        let active = self
            .interlock
            .active_server()
            .ok_or_else(|| HarnessError::Precondition("no server in active state".into()))?;
        self.stop_and_await(&active).await?;
        tracing::debug!("<<< terminate_active");
        Ok(())
    }

    /// Stops an arbitrary passive server, if any, and waits for its
    /// termination. Doing nothing is a legal outcome.
    pub async fn terminate_one_passive(&self) -> Result<(), HarnessError> {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> terminate_one_passive");
        if let Some(passive) = self.interlock.one_passive_server() {
            self.stop_and_await(&passive).await?;
        }
        tracing::debug!("<<< terminate_one_passive");
        Ok(())
    }

    /// Brings the whole cluster down: waits until every server has settled,
    /// then stops the passives one at a time, then the active. Passives go
    /// first — stopping the active first can trigger a fail-over that
    /// reclassifies a passive mid-shutdown.
    pub async fn terminate_all_servers(&self) -> Result<(), HarnessError> {
        let _serial = self.serial.lock().await;
        tracing::debug!(">>> terminate_all_servers");
        self.interlock.wait_for_all_ready().await?;

        while let Some(passive) = self.interlock.one_passive_server() {
            self.stop_and_await(&passive).await?;
        }
        if let Some(active) = self.interlock.active_server() {
            self.stop_and_await(&active).await?;
        }
        tracing::debug!("<<< terminate_all_servers");
        Ok(())
    }

    async fn stop_and_await(&self, server: &Arc<ServerSupervisor>) -> Result<(), HarnessError> {
        server.stop().await?;
        self.interlock
            .wait_for_server_termination(server.name())
            .await
    }
}
