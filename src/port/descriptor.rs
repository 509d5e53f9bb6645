//! Service descriptors identifying topics

use serde::{Deserialize, Serialize};

use crate::error::{MonetError, Result};
use crate::layout::constants::MAX_DESCRIPTOR_COMPONENT_LEN;

/// A `(service, instance, event)` triple identifying one topic
///
/// Equality matches publishers to subscribers; the derived ordering is
/// lexicographic over the three components in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    service: String,
    instance: String,
    event: String,
}

impl ServiceDescriptor {
    /// Create a descriptor, enforcing the per-component length bound
    pub fn new(
        service: impl Into<String>,
        instance: impl Into<String>,
        event: impl Into<String>,
    ) -> Result<Self> {
        let descriptor = Self {
            service: service.into(),
            instance: instance.into(),
            event: event.into(),
        };
        for (field, value) in [
            ("service", &descriptor.service),
            ("instance", &descriptor.instance),
            ("event", &descriptor.event),
        ] {
            if value.is_empty() {
                return Err(MonetError::invalid_parameter(field, "component cannot be empty"));
            }
            if value.len() > MAX_DESCRIPTOR_COMPONENT_LEN {
                return Err(MonetError::invalid_parameter(
                    field,
                    format!("component exceeds {} bytes", MAX_DESCRIPTOR_COMPONENT_LEN),
                ));
            }
        }
        Ok(descriptor)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

impl std::fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}
