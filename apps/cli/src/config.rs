//! CLI configuration file: kit settings plus the simulated devices to
//! expose through the mock transports.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use dmk_core::transport::SimulatedDevice;
use dmk_core::{AppInfo, DeviceDescriptor, DeviceModelId, DmkConfig, MockTransport, TransportKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub model: DeviceModelId,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub locked: bool,
    /// Defaults to a full battery on models that have one.
    #[serde(default)]
    pub battery: Option<u8>,
    /// Running application; the dashboard when absent.
    #[serde(default)]
    pub app: Option<AppInfo>,
}

fn default_transport() -> TransportKind {
    TransportKind::Simulated
}

impl DeviceConfig {
    pub fn descriptor(&self) -> DeviceDescriptor {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| self.model.product_name().to_string());
        DeviceDescriptor::new(self.id.as_str(), name, self.transport, self.model)
    }

    pub fn simulated(&self) -> SimulatedDevice {
        let mut device = SimulatedDevice::new(self.model).locked(self.locked);
        if let Some(app) = &self.app {
            device = device.with_app(&app.name, &app.version);
        }
        if self.battery.is_some() {
            device.battery = self.battery;
        }
        device
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub kit: DmkConfig,
    pub devices: Vec<DeviceConfig>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            kit: DmkConfig::default(),
            devices: vec![
                DeviceConfig {
                    id: "hid-2c97-4011".to_string(),
                    name: Some("Nano X".to_string()),
                    model: DeviceModelId::NanoX,
                    transport: TransportKind::Usb,
                    locked: false,
                    battery: Some(78),
                    app: Some(AppInfo {
                        name: "Ethereum".to_string(),
                        version: "1.10.4".to_string(),
                    }),
                },
                DeviceConfig {
                    id: "speculos-stax".to_string(),
                    name: None,
                    model: DeviceModelId::Stax,
                    transport: TransportKind::Simulated,
                    locked: false,
                    battery: None,
                    app: None,
                },
            ],
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// One mock transport per transport kind, populated with the devices.
    pub fn transports(&self) -> Vec<MockTransport> {
        let mut by_kind: BTreeMap<String, MockTransport> = BTreeMap::new();
        for device in &self.devices {
            let transport = by_kind
                .entry(device.transport.to_string())
                .or_insert_with(|| MockTransport::with_kind(device.transport));
            transport.add_simulated(device.descriptor(), device.simulated());
        }
        by_kind.into_values().collect()
    }
}
