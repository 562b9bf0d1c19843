use crate::sandbox::{SandboxConfig, SandboxError, setup_error};
use anyhow::{Context, Result};
use nix::sched::{CloneFlags, setns};
use rtnetlink::{Handle, new_connection};
use std::fs::File;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use tokio::sync::oneshot;

/// Address the proxy binds for IPv6 inbound passthrough traffic.
pub const IPV6_PASSTHROUGH_ADDRESS: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 6);

/// Netlink queries against the links and addresses of one network namespace.
pub struct LinkInspector {
    handle: Handle,
}

impl LinkInspector {
    pub async fn new() -> Result<Self> {
        let (connection, handle, _) = new_connection().context("Failed to open netlink socket")?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Inspector for the sandbox's namespace when there is one, otherwise
    /// for the caller's.
    pub async fn for_sandbox(sandbox: Option<&SandboxConfig>) -> Result<Self> {
        match sandbox {
            Some(sandbox) => Self::in_namespace(&sandbox.netns_path).await,
            None => Self::new().await,
        }
    }

    /// Open the netlink socket from a thread that joined `netns_path`.
    ///
    /// A netlink socket stays bound to the namespace it was created in, so
    /// every query made through the returned inspector targets that
    /// namespace. The thread exits once the connection is handed to the
    /// runtime.
    pub async fn in_namespace(netns_path: &Path) -> Result<Self> {
        let (tx, rx) = oneshot::channel();
        let runtime = tokio::runtime::Handle::current();
        let netns_path = netns_path.to_path_buf();

        std::thread::Builder::new()
            .name("tproxy-netlink".to_string())
            .spawn(move || {
                let _ = tx.send(open_in_namespace(&runtime, &netns_path));
            })
            .map_err(|e| setup_error("spawn netlink thread", e))?;

        let handle = rx.await.map_err(|_| SandboxError::Disconnected)??;
        Ok(Self { handle })
    }

    /// Name of the first link flagged as loopback.
    pub async fn loopback_name(&self) -> Result<String> {
        use futures::stream::TryStreamExt;
        use netlink_packet_route::link::{LinkAttribute, LinkFlag};

        let mut links = self.handle.link().get().execute();

        while let Some(link) = links.try_next().await? {
            if !link.header.flags.contains(&LinkFlag::Loopback) {
                continue;
            }

            let name = link.attributes.iter().find_map(|attr| {
                if let LinkAttribute::IfName(n) = attr {
                    Some(n.clone())
                } else {
                    None
                }
            });

            if let Some(name) = name {
                return Ok(name);
            }
        }

        anyhow::bail!("no loopback interface found on the system")
    }

    /// True when any interface carries a non-loopback IPv6 address.
    pub async fn has_local_ipv6(&self) -> Result<bool> {
        use futures::stream::TryStreamExt;
        use netlink_packet_route::address::AddressAttribute;

        let mut addrs = self.handle.address().get().execute();

        while let Some(addr_msg) = addrs.try_next().await? {
            let found = addr_msg.attributes.iter().any(|attr| {
                matches!(attr, AddressAttribute::Address(IpAddr::V6(ip)) if !ip.is_loopback())
            });
            if found {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Equivalent of `ip -6 addr add ::6/128 dev <iface>`; an existing
    /// address is not an error.
    pub async fn add_ipv6_passthrough_address(&self, iface: &str) -> Result<()> {
        let link_index = self.get_link_by_name(iface).await?;

        let result = self
            .handle
            .address()
            .add(link_index, IPV6_PASSTHROUGH_ADDRESS.into(), 128)
            .execute()
            .await;

        match result {
            Ok(()) => {
                tracing::debug!("added {}/128 to {}", IPV6_PASSTHROUGH_ADDRESS, iface);
                Ok(())
            }
            Err(err) if err.to_string().to_lowercase().contains("file exists") => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "Failed to add IPv6 address {}/128 to {}",
                    IPV6_PASSTHROUGH_ADDRESS, iface
                )
            }),
        }
    }

    /// Name of the link carrying `ip`, if any.
    pub async fn interface_with_address(&self, ip: IpAddr) -> Result<Option<String>> {
        use futures::stream::TryStreamExt;
        use netlink_packet_route::address::AddressAttribute;
        use netlink_packet_route::link::LinkAttribute;

        let mut addrs = self.handle.address().get().execute();
        let mut index = None;

        while let Some(addr_msg) = addrs.try_next().await? {
            let found = addr_msg
                .attributes
                .iter()
                .any(|attr| matches!(attr, AddressAttribute::Address(addr) if *addr == ip));
            if found {
                index = Some(addr_msg.header.index);
                break;
            }
        }

        let Some(index) = index else {
            return Ok(None);
        };

        let mut links = self.handle.link().get().match_index(index).execute();
        let Some(link) = links.try_next().await? else {
            return Ok(None);
        };

        Ok(link.attributes.iter().find_map(|attr| {
            if let LinkAttribute::IfName(n) = attr {
                Some(n.clone())
            } else {
                None
            }
        }))
    }

    async fn get_link_by_name(&self, name: &str) -> Result<u32> {
        use futures::stream::TryStreamExt;

        let mut links = self.handle.link().get().match_name(name.to_string()).execute();

        if let Some(link) = links.try_next().await? {
            Ok(link.header.index)
        } else {
            anyhow::bail!("Link {} not found", name)
        }
    }
}

fn open_in_namespace(
    runtime: &tokio::runtime::Handle,
    netns_path: &Path,
) -> Result<Handle, SandboxError> {
    let netns = File::open(netns_path)
        .map_err(|e| setup_error(&format!("open {}", netns_path.display()), e))?;
    setns(&netns, CloneFlags::CLONE_NEWNET)
        .map_err(|e| setup_error("switch network namespace", e))?;

    // The socket registers with the caller's reactor.
    let _guard = runtime.enter();
    let (connection, handle, _) =
        new_connection().map_err(|e| setup_error("open netlink socket", e))?;
    runtime.spawn(connection);

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sandboxed_inspector_joins_the_namespace() {
        let sandbox = SandboxConfig::new("/nonexistent/netns/tproxy-test");
        let err = match LinkInspector::for_sandbox(Some(&sandbox)).await {
            Ok(_) => panic!("namespace does not exist"),
            Err(err) => err,
        };

        match err.downcast_ref::<SandboxError>() {
            Some(SandboxError::Setup(msg)) => {
                assert!(msg.starts_with("open /nonexistent/netns/tproxy-test"), "{}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_passthrough_address() {
        assert_eq!(IPV6_PASSTHROUGH_ADDRESS.to_string(), "::6");
    }
}
