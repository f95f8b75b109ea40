use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::Resource;

pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_VERSION: &str = "service.version";
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// Static metadata identifying this process on every span it emits.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceIdentity {
    service_name: String,
    attributes: Vec<(&'static str, String)>,
}

impl ServiceIdentity {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_owned(),
            attributes: Vec::new(),
        }
    }

    pub fn with_environment(self, environment: &str) -> Self {
        self.with_attribute(DEPLOYMENT_ENVIRONMENT, environment)
    }

    pub fn with_version(self, version: &str) -> Self {
        self.with_attribute(SERVICE_VERSION, version)
    }

    fn with_attribute(mut self, key: &'static str, value: &str) -> Self {
        self.attributes.retain(|(existing, _)| *existing != key);
        self.attributes.push((key, value.to_owned()));
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        if key == SERVICE_NAME {
            return Some(&self.service_name);
        }
        self.attributes
            .iter()
            .find(|(existing, _)| *existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new(
            SERVICE_NAME,
            Value::from(self.service_name.clone()),
        )];
        attributes.extend(
            self.attributes
                .iter()
                .map(|(key, value)| KeyValue::new(*key, Value::from(value.clone()))),
        );
        Resource::new(attributes)
    }
}
