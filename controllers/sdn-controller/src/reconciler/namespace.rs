//! Namespace reconciler
//!
//! Records on each namespace which subnets serve it, so pods created there
//! land in the right logical switch.

use super::Reconciler;
use crate::annotations::{self, AnnotationPatch};
use crate::error::ControllerError;
use tracing::{debug, info};

impl Reconciler {
    /// Subnets bound to `namespace`, sorted; the default subnet when none claims it.
    pub(crate) fn subnets_for_namespace(&self, namespace: &str) -> Vec<(String, String)> {
        let mut bound: Vec<(String, String)> = self
            .cluster
            .subnets()
            .iter()
            .filter(|s| s.spec.namespaces.iter().any(|n| n == namespace))
            .filter_map(|s| Some((s.metadata.name.clone()?, s.spec.cidr_block.clone())))
            .collect();
        bound.sort();
        if bound.is_empty() {
            let cidr = self
                .cluster
                .subnet(&self.config.default_logical_switch)
                .map_or_else(|| self.config.default_cidr.clone(), |s| s.spec.cidr_block.clone());
            bound.push((self.config.default_logical_switch.clone(), cidr));
        }
        bound
    }

    /// Writes the `logical_switch` and `cidr` annotations of a namespace when they changed.
    pub async fn reconcile_namespace(&self, name: &str) -> Result<(), ControllerError> {
        let Some(namespace) = self.cluster.namespace(name) else {
            debug!("Namespace {} no longer exists, skipping", name);
            return Ok(());
        };

        let bound = self.subnets_for_namespace(name);
        let switches = bound.iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>().join(",");
        let cidrs = bound.iter().map(|(_, c)| c.as_str()).collect::<Vec<_>>().join(";");

        let current = namespace.metadata.annotations.as_ref();
        let mut patch = AnnotationPatch::new();
        if annotations::get(current, annotations::LOGICAL_SWITCH) != Some(switches.as_str()) {
            patch.insert(annotations::LOGICAL_SWITCH.to_string(), Some(switches.clone()));
        }
        if annotations::get(current, annotations::CIDR) != Some(cidrs.as_str()) {
            patch.insert(annotations::CIDR.to_string(), Some(cidrs));
        }
        if patch.is_empty() {
            return Ok(());
        }

        info!("Binding Namespace {} to subnets {}", name, switches);
        self.cluster.patch_namespace_annotations(name, &patch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::annotations;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_namespace_defaults_to_default_subnet() {
        let (reconciler, cluster, _) = test_reconciler();
        cluster.add_namespace(create_test_namespace("shop"));

        reconciler.reconcile_namespace("shop").await.unwrap();

        let annotations = cluster.namespace_annotations("shop");
        assert_eq!(annotations[annotations::LOGICAL_SWITCH], "ovn-default");
        assert_eq!(annotations[annotations::CIDR], "10.16.0.0/16");
    }

    #[tokio::test]
    async fn test_namespace_lists_every_bound_subnet() {
        let (reconciler, cluster, _) = test_reconciler();
        cluster.add_namespace(create_test_namespace("shop"));
        for (name, cidr) in [("shop-b", "10.2.0.0/24"), ("shop-a", "10.1.0.0/24")] {
            let mut subnet = create_test_subnet(name, cidr, None);
            subnet.spec.namespaces = vec!["shop".to_string()];
            cluster.add_subnet(subnet);
        }

        reconciler.reconcile_namespace("shop").await.unwrap();

        let annotations = cluster.namespace_annotations("shop");
        assert_eq!(annotations[annotations::LOGICAL_SWITCH], "shop-a,shop-b");
        assert_eq!(annotations[annotations::CIDR], "10.1.0.0/24;10.2.0.0/24");

        // Unchanged bindings are not rewritten
        let patches = cluster.annotation_patch_count();
        reconciler.reconcile_namespace("shop").await.unwrap();
        assert_eq!(cluster.annotation_patch_count(), patches);
    }
}
