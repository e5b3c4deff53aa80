//! NAT port forwarding so the communicator can reach the guest.

use std::sync::Arc;

use async_trait::async_trait;
use vboxbuild_shared::constants::nat;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::config::CommType;
use crate::driver::Driver;
use crate::net::{PortAllocator, PortReservation};
use crate::pipeline::Step;
use crate::state::BuildState;
use crate::util::{RetryPolicy, retry};
use crate::vbox_args;
use crate::version::{CanonicalVersion, LOCALHOST_REACHABLE_MIN};

/// Installing the rule is attempted at most twice: a stale rule of the same
/// name is deleted between the attempts.
const RULE_INSTALL_RETRY: RetryPolicy = RetryPolicy::attempts(2);

/// Produces `comm_host_port`. Cleanup releases the port booking; the rule
/// itself goes away with the VM.
#[derive(Debug, Default)]
pub struct StepPortForwarding {
    reservation: Option<PortReservation>,
}

impl StepPortForwarding {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Allow NAT guests to reach host loopback on hypervisors that block it by
/// default. Issues no command on older releases.
pub async fn add_access_to_localhost(driver: &dyn Driver, vm: &str) -> BuildResult<()> {
    let raw = driver
        .version()
        .await
        .map_err(|e| e.context("error getting VirtualBox version"))?;
    let version = CanonicalVersion::parse(&raw).map_err(|e| {
        e.context(format!("the VirtualBox version isn't a valid SemVer: {}", raw))
    })?;

    if version.at_least(&LOCALHOST_REACHABLE_MIN) {
        driver
            .vboxmanage(&vbox_args!["modifyvm", vm, "--nat-localhostreachable1", "on"])
            .await
            .map_err(|e| {
                e.context("failed to configure host's local network as reachable for NAT interface")
            })?;
        tracing::trace!(%version, "Set --nat-localhostreachable1 on");
    }
    Ok(())
}

fn is_rule_conflict(err: &BuildError) -> bool {
    err.stderr()
        .is_some_and(|stderr| stderr.contains(nat::RULE_EXISTS_MARKER))
}

/// Install the communicator rule, deleting a stale rule of the same name
/// once if needed.
async fn install_rule(driver: Arc<dyn Driver>, vm: &str, rule: &str) -> BuildResult<()> {
    let install = vbox_args!["modifyvm", vm, "--natpf1", rule];
    let delete = vbox_args!["modifyvm", vm, "--natpf1", "delete", nat::COMM_RULE_NAME];

    retry(
        RULE_INSTALL_RETRY,
        |attempt| {
            let driver = driver.clone();
            let install = install.clone();
            let delete = delete.clone();
            async move {
                if attempt > 0 {
                    tracing::info!("A NAT rule of this name already exists, deleting it");
                    driver
                        .vboxmanage(&delete)
                        .await
                        .map_err(|e| e.context("error deleting NAT forwarding rule"))?;
                }
                driver.vboxmanage(&install).await.map_err(|e| {
                    if is_rule_conflict(&e) {
                        BuildError::Conflict(e.to_string())
                    } else {
                        e
                    }
                })
            }
        },
        BuildError::is_conflict,
    )
    .await
}

#[async_trait]
impl Step for StepPortForwarding {
    fn name(&self) -> &'static str {
        "port_forwarding"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let config = state.config.clone();
        let driver = state.driver.clone();

        if config.communicator.comm_type == CommType::None {
            tracing::info!("Not using a communicator, skipping port forwarding");
            state.comm_host_port = Some(0);
            return Ok(());
        }

        let guest_port = config.communicator.port();
        if config.skip_nat_mapping {
            state.comm_host_port = Some(guest_port);
            return Ok(());
        }

        let vm = state.vm_name()?.to_string();

        tracing::info!(
            min = config.host_port_min,
            max = config.host_port_max,
            "Looking for available communicator port"
        );
        let allocator = PortAllocator::new(
            "127.0.0.1",
            config.host_port_min,
            config.host_port_max,
            &config.port_lock_dir,
        );
        let reservation = allocator
            .reserve()
            .await
            .map_err(|e| e.context("error creating port forwarding rule"))?;
        let host_port = reservation.port;
        self.reservation = Some(reservation);

        let result = async {
            driver
                .vboxmanage(&vbox_args!["modifyvm", vm, "--nic1", "nat"])
                .await
                .map_err(|e| e.context("failed to configure NAT interface"))?;

            add_access_to_localhost(driver.as_ref(), &vm).await?;

            state.ui.say(&format!(
                "Creating forwarded port mapping for communicator (SSH, WinRM, etc) (host port {})",
                host_port
            ));
            let rule = format!(
                "{},tcp,{},{},,{}",
                nat::COMM_RULE_NAME,
                config.ssh_listen_address,
                host_port,
                guest_port
            );
            install_rule(driver.clone(), &vm, &rule)
                .await
                .map_err(|e| e.context("error creating port forwarding rule"))
        }
        .await;

        if let Err(e) = result {
            self.reservation = None;
            return Err(e);
        }

        state.comm_host_port = Some(host_port);
        Ok(())
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> BuildResult<()> {
        if let Some(mut reservation) = self.reservation.take() {
            reservation.release();
        }
        Ok(())
    }
}
