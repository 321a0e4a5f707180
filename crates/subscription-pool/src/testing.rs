//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::credential::Credential;
use crate::registry::{Registry, SubscriptionDescriptor};

pub(crate) fn descriptor(name: &str, max_concurrent: u32, priority: u32) -> SubscriptionDescriptor {
    SubscriptionDescriptor {
        name: name.into(),
        credential: Credential::parse(&format!("sk-ant-{name}")).unwrap(),
        max_concurrent,
        priority,
        enabled: true,
    }
}

pub(crate) fn registry(specs: &[(&str, u32, u32)]) -> Arc<Registry> {
    let descriptors = specs
        .iter()
        .map(|(name, max, priority)| descriptor(name, *max, *priority))
        .collect();
    Arc::new(Registry::new(descriptors).unwrap())
}
