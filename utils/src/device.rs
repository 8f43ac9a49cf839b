pub use cpal;

use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no audio device named {0:?}")]
    NotFound(String),
    #[error("no default {0} device")]
    NoDefault(&'static str),
    #[error("audio device is busy: {0}")]
    Busy(String),
    #[error("audio device access denied: {0}")]
    PermissionDenied(String),
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl From<cpal::DevicesError> for DeviceError {
    fn from(e: cpal::DevicesError) -> Self {
        DeviceError::Backend(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for DeviceError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NotFound("device not available".to_string()),
            cpal::BuildStreamError::BackendSpecific { err } => classify_backend(err.description),
            other => DeviceError::Backend(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for DeviceError {
    fn from(e: cpal::PlayStreamError) -> Self {
        match e {
            cpal::PlayStreamError::DeviceNotAvailable => DeviceError::NotFound("device not available".to_string()),
            cpal::PlayStreamError::BackendSpecific { err } => classify_backend(err.description),
        }
    }
}

impl From<cpal::DefaultStreamConfigError> for DeviceError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceError::NotFound("device not available".to_string()),
            other => DeviceError::Backend(other.to_string()),
        }
    }
}

// Backends report busy/denied devices only as free-form text.
fn classify_backend(description: String) -> DeviceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted") {
        DeviceError::PermissionDenied(description)
    } else if lower.contains("busy") || lower.contains("in use") {
        DeviceError::Busy(description)
    } else {
        DeviceError::Backend(description)
    }
}

fn get_host() -> cpal::Host {
    cpal::default_host()
}

pub fn get_or_default_input(device_name: Option<String>) -> Result<Device, DeviceError> {
    let host = get_host();
    tracing::debug!("Host: {:?}", host.id());
    let Some(target) = device_name else {
        return host.default_input_device().ok_or(DeviceError::NoDefault("input"));
    };

    host.input_devices()?
        .find(|device| device.name().is_ok_and(|name| name == target))
        .ok_or(DeviceError::NotFound(target))
}

pub fn get_or_default_output(device_name: Option<String>) -> Result<Device, DeviceError> {
    let host = get_host();
    let Some(target) = device_name else {
        return host.default_output_device().ok_or(DeviceError::NoDefault("output"));
    };

    host.output_devices()?
        .find(|device| device.name().is_ok_and(|name| name == target))
        .ok_or(DeviceError::NotFound(target))
}

fn describe(device: &Device, config: Option<cpal::SupportedStreamConfig>, default_name: Option<&str>) -> Option<String> {
    let d_name = device.name().ok()?;
    let config = config?;
    let mut d = format!(" * {}({}ch, {}hz)", d_name, config.channels(), config.sample_rate().0);
    if Some(d_name.as_str()) == default_name {
        d.push_str(" [default]");
    }
    Some(d)
}

pub fn get_available_inputs() -> Result<String, DeviceError> {
    for host in cpal::available_hosts() {
        tracing::debug!("Available host: {:?}", host);
    }

    let host = get_host();
    let default_device = host.default_input_device().and_then(|d| d.name().ok());
    let device_names: Vec<String> = host.input_devices()?
        .filter_map(|device| {
            let config = device.default_input_config().ok();
            describe(&device, config, default_device.as_deref())
        })
        .collect();
    Ok(device_names.join("\n"))
}

pub fn get_available_outputs() -> Result<String, DeviceError> {
    let host = get_host();
    let default_device = host.default_output_device().and_then(|d| d.name().ok());
    let device_names: Vec<String> = host.output_devices()?
        .filter_map(|device| {
            let config = device.default_output_config().ok();
            describe(&device, config, default_device.as_deref())
        })
        .collect();
    Ok(device_names.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_messages_are_classified() {
        assert!(matches!(classify_backend("Permission denied".into()), DeviceError::PermissionDenied(_)));
        assert!(matches!(classify_backend("Device or resource busy".into()), DeviceError::Busy(_)));
        assert!(matches!(classify_backend("something odd".into()), DeviceError::Backend(_)));
    }
}
