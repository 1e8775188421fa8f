use strum::IntoEnumIterator;
use tracing::instrument;
use uuid::Uuid;

use super::model::{CharacteristicInfo, ServiceInfo};
use crate::error::TagError;
use crate::protocol::TagCharacteristic;

/// The characteristics a paired tag session needs, discovered once per
/// pairing attempt.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequiredCharacteristics {
    command: CharacteristicInfo,
    response: CharacteristicInfo,
    notify: CharacteristicInfo,
    raw: CharacteristicInfo,
    battery: CharacteristicInfo,
    device_name: CharacteristicInfo,
}

impl RequiredCharacteristics {
    /// Extracts every required characteristic from discovered services.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::ServiceDiscovery`] when no services were reported
    /// or any required characteristic is missing.
    #[instrument(skip(services), level = "debug", fields(service_count = services.len()))]
    pub fn from_services(services: &[ServiceInfo]) -> Result<Self, TagError> {
        if services.is_empty() {
            return Err(TagError::ServiceDiscovery {
                reason: "the peripheral reported no services".to_string(),
            });
        }

        let missing: Vec<TagCharacteristic> = TagCharacteristic::iter()
            .filter(|characteristic| find_characteristic(services, characteristic.uuid()).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(TagError::ServiceDiscovery {
                reason: format!("missing characteristics: {}", format_missing(&missing)),
            });
        }

        let lookup = |characteristic: TagCharacteristic| {
            find_characteristic(services, characteristic.uuid())
                .cloned()
                .ok_or_else(|| TagError::ServiceDiscovery {
                    reason: format!("missing characteristics: {characteristic}"),
                })
        };

        Ok(Self {
            command: lookup(TagCharacteristic::Command)?,
            response: lookup(TagCharacteristic::Response)?,
            notify: lookup(TagCharacteristic::Notify)?,
            raw: lookup(TagCharacteristic::Raw)?,
            battery: lookup(TagCharacteristic::BatteryLevel)?,
            device_name: lookup(TagCharacteristic::DeviceName)?,
        })
    }

    /// Returns the handle for one characteristic.
    #[must_use]
    pub fn get(&self, characteristic: TagCharacteristic) -> &CharacteristicInfo {
        match characteristic {
            TagCharacteristic::Command => &self.command,
            TagCharacteristic::Response => &self.response,
            TagCharacteristic::Notify => &self.notify,
            TagCharacteristic::Raw => &self.raw,
            TagCharacteristic::BatteryLevel => &self.battery,
            TagCharacteristic::DeviceName => &self.device_name,
        }
    }

    #[must_use]
    pub fn command(&self) -> &CharacteristicInfo {
        &self.command
    }

    #[must_use]
    pub fn response(&self) -> &CharacteristicInfo {
        &self.response
    }

    #[must_use]
    pub fn notify(&self) -> &CharacteristicInfo {
        &self.notify
    }

    #[must_use]
    pub fn raw(&self) -> &CharacteristicInfo {
        &self.raw
    }

    #[must_use]
    pub fn battery(&self) -> &CharacteristicInfo {
        &self.battery
    }

    #[must_use]
    pub fn device_name(&self) -> &CharacteristicInfo {
        &self.device_name
    }
}

fn find_characteristic(services: &[ServiceInfo], uuid: Uuid) -> Option<&CharacteristicInfo> {
    services
        .iter()
        .flat_map(ServiceInfo::characteristics)
        .find(|characteristic| characteristic.uuid() == uuid)
}

fn format_missing(characteristics: &[TagCharacteristic]) -> String {
    characteristics
        .iter()
        .map(|characteristic| format!("{characteristic} ({})", characteristic.uuid()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hw::fake_backend::tag_services;
    use crate::protocol::TAG_SERVICE_UUID;

    #[test]
    fn extraction_resolves_every_characteristic() {
        let characteristics = RequiredCharacteristics::from_services(&tag_services())
            .expect("default tag services should carry every characteristic");

        for characteristic in TagCharacteristic::iter() {
            assert_eq!(characteristic.uuid(), characteristics.get(characteristic).uuid());
        }
    }

    #[test]
    fn extraction_rejects_empty_service_list() {
        let result = RequiredCharacteristics::from_services(&[]);
        assert_matches!(result, Err(TagError::ServiceDiscovery { reason }) if reason.contains("no services"));
    }

    #[test]
    fn extraction_names_missing_characteristics() {
        let services = vec![ServiceInfo::new(
            TAG_SERVICE_UUID,
            true,
            vec![CharacteristicInfo::new(
                TagCharacteristic::Command.uuid(),
                Vec::new(),
            )],
        )];

        let result = RequiredCharacteristics::from_services(&services);

        assert_matches!(
            result,
            Err(TagError::ServiceDiscovery { reason })
            if reason.contains("response (d45c2030") && !reason.contains("command")
        );
    }
}
