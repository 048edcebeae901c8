//! Device lookup and enumeration on the default cpal host.

use cpal::traits::{DeviceTrait, HostTrait};
use log::debug;

use crate::config::DeviceSelector;
use crate::error::{DetectorError, Result};

/// Name fragments of input devices that actually carry the output mix.
const LOOPBACK_KEYWORDS: [&str; 4] = ["stereo mix", "wave out mix", "loopback", "what u hear"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in the host's enumeration; usable as `DeviceSelector::Index`.
    pub index: usize,
    pub name: String,
    /// Maximum channel count the device offers.
    pub channels: u16,
    pub default_sample_rate: Option<u32>,
    pub is_default: bool,
}

impl DeviceInfo {
    /// True for inputs named like a hardware loopback ("Stereo Mix" etc.).
    pub fn looks_like_loopback(&self) -> bool {
        let name = self.name.to_lowercase();
        LOOPBACK_KEYWORDS.iter().any(|keyword| name.contains(keyword))
    }
}

/// Lists every device that can record, with its channel count.
pub fn list_input_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let mut infos = Vec::new();
    for (index, device) in host.input_devices()?.enumerate() {
        let name = device.name().unwrap_or_else(|_| format!("Input {index}"));
        let channels = device
            .supported_input_configs()
            .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
            .unwrap_or(0);
        let default_sample_rate = device.default_input_config().ok().map(|c| c.sample_rate().0);
        infos.push(DeviceInfo {
            index,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            channels,
            default_sample_rate,
        });
    }
    debug!("Found {} input devices", infos.len());
    Ok(infos)
}

/// Lists every device that can play, i.e. every loopback candidate.
pub fn list_output_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let mut infos = Vec::new();
    for (index, device) in host.output_devices()?.enumerate() {
        let name = device.name().unwrap_or_else(|_| format!("Output {index}"));
        let channels = device
            .supported_output_configs()
            .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
            .unwrap_or(0);
        let default_sample_rate = device.default_output_config().ok().map(|c| c.sample_rate().0);
        infos.push(DeviceInfo {
            index,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            channels,
            default_sample_rate,
        });
    }
    debug!("Found {} output devices", infos.len());
    Ok(infos)
}

fn has_name(device: &cpal::Device, wanted: &str) -> bool {
    device.name().map(|name| name == wanted).unwrap_or(false)
}

pub(crate) fn find_input_device(selector: &DeviceSelector) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match selector {
        DeviceSelector::Default => host.default_input_device().ok_or(DetectorError::NoDevice),
        DeviceSelector::Index(index) => host
            .input_devices()?
            .nth(*index)
            .ok_or_else(|| DetectorError::DeviceNotFound(format!("input #{index}"))),
        DeviceSelector::Name(name) => host
            .input_devices()?
            .find(|d| has_name(d, name))
            .ok_or_else(|| DetectorError::DeviceNotFound(name.clone())),
    }
}

pub(crate) fn find_output_device(selector: &DeviceSelector) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match selector {
        DeviceSelector::Default => host.default_output_device().ok_or(DetectorError::NoDevice),
        DeviceSelector::Index(index) => host
            .output_devices()?
            .nth(*index)
            .ok_or_else(|| DetectorError::DeviceNotFound(format!("output #{index}"))),
        DeviceSelector::Name(name) => host
            .output_devices()?
            .find(|d| has_name(d, name))
            .ok_or_else(|| DetectorError::DeviceNotFound(name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> DeviceInfo {
        DeviceInfo {
            index: 0,
            name: name.to_string(),
            channels: 2,
            default_sample_rate: Some(48_000),
            is_default: false,
        }
    }

    #[test]
    fn recognises_loopback_style_inputs() {
        assert!(info("Stereo Mix (Realtek Audio)").looks_like_loopback());
        assert!(info("What U Hear (Sound Blaster)").looks_like_loopback());
        assert!(!info("USB Microphone").looks_like_loopback());
    }
}
