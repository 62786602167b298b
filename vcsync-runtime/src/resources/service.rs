//! Service adapter.
//!
//! Services are the kind where the super side assigns spec fields
//! (cluster IPs, node ports) that the tenant copy must learn about, so
//! this adapter opts into upward spec propagation in addition to status.

use crate::{
    error::SyncError,
    sync::{Adapter, UpwardSpecPolicy},
};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use vcsync_core::{equality, projection, Delegate};

/// Syncs tenant services downward and reflects allocated addressing back.
#[derive(Default)]
pub struct ServiceAdapter;

/// The spec with every super-allocated field cleared, leaving only what the
/// tenant author wrote. Headless services keep their `None` sentinel.
fn authored_spec(spec: Option<&ServiceSpec>) -> Option<ServiceSpec> {
    let mut spec = spec.cloned()?;
    if spec.cluster_ip.as_deref() != Some("None") {
        spec.cluster_ip = None;
        spec.cluster_ips = None;
    }
    if let Some(ports) = &mut spec.ports {
        for port in ports {
            port.node_port = None;
        }
    }
    Some(spec)
}

impl Adapter for ServiceAdapter {
    type Object = Service;

    fn name(&self) -> &'static str {
        "service"
    }

    fn excluded(&self, v: &Service) -> bool {
        // The control plane's own endpoint service stays with its cluster.
        v.metadata.name.as_deref() == Some("kubernetes")
            && v.metadata.namespace.as_deref() == Some("default")
    }

    fn project(
        &self,
        delegate: &Delegate,
        location: &projection::Location,
        v: &Service,
    ) -> Result<Service, SyncError> {
        Ok(Service {
            metadata: projection::projected_meta(&v.metadata, delegate, location.clone()),
            spec: authored_spec(v.spec.as_ref()),
            status: None,
        })
    }

    fn downward_equal(&self, projected: &Service, p: &Service) -> bool {
        equality::meta_equal(&projected.metadata, &p.metadata)
            && equality::values_equal(
                &authored_spec(projected.spec.as_ref()),
                &authored_spec(p.spec.as_ref()),
            )
    }

    fn upward_spec_policy(&self) -> UpwardSpecPolicy {
        UpwardSpecPolicy::SpecAndStatus
    }

    fn apply_upward_spec(&self, v: &mut Service, p: &Service) -> bool {
        let Some(p_spec) = p.spec.as_ref() else { return false };
        let v_spec = v.spec.get_or_insert_with(ServiceSpec::default);
        let mut changed = false;
        if v_spec.cluster_ip != p_spec.cluster_ip {
            v_spec.cluster_ip = p_spec.cluster_ip.clone();
            changed = true;
        }
        if v_spec.cluster_ips != p_spec.cluster_ips {
            v_spec.cluster_ips = p_spec.cluster_ips.clone();
            changed = true;
        }
        if let (Some(v_ports), Some(p_ports)) = (v_spec.ports.as_mut(), p_spec.ports.as_ref()) {
            for (v_port, p_port) in v_ports.iter_mut().zip(p_ports) {
                if v_port.node_port != p_port.node_port {
                    v_port.node_port = p_port.node_port;
                    changed = true;
                }
            }
        }
        changed
    }
}
