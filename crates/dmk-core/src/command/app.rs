//! Application management commands (BOLOS and dashboard).

use super::{Command, expect_empty};
use crate::device::AppInfo;
use crate::protocol::constants::*;
use crate::protocol::{ApduBuilder, ApduCommand, ApduError, ApduParser, ApduResponse};

/// Name and version of the running application.
///
/// On the dashboard the device answers with `BOLOS` and the OS version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAppAndVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppAndVersion {
    pub name: String,
    pub version: String,
    pub flags: Option<Vec<u8>>,
}

impl AppAndVersion {
    pub fn is_dashboard(&self) -> bool {
        self.name == DASHBOARD_APP_NAME
    }

    /// The running application, `None` on the dashboard.
    pub fn app_info(&self) -> Option<AppInfo> {
        (!self.is_dashboard()).then(|| AppInfo {
            name: self.name.clone(),
            version: self.version.clone(),
        })
    }
}

impl Command for GetAppAndVersion {
    type Output = AppAndVersion;

    fn name(&self) -> &'static str {
        "GetAppAndVersion"
    }

    fn apdu(&self) -> Result<ApduCommand, ApduError> {
        Ok(ApduCommand::new(CLA_BOLOS, INS_GET_APP_AND_VERSION, 0x00, 0x00))
    }

    fn parse(&self, response: &ApduResponse) -> Result<AppAndVersion, ApduError> {
        let mut parser = ApduParser::new(response);
        let format = parser.extract_u8()?;
        if format != APP_AND_VERSION_FORMAT {
            return Err(ApduError::InvalidField {
                field: "format",
                reason: format!("unsupported format {:#04x}", format),
            });
        }
        let name = parser.extract_lv_string()?;
        let version = parser.extract_lv_string()?;
        let flags = if parser.is_empty() {
            None
        } else {
            Some(parser.extract_lv()?.to_vec())
        };
        Ok(AppAndVersion { name, version, flags })
    }
}

/// Quit the running application and go back to the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseApp;

impl Command for CloseApp {
    type Output = ();

    fn name(&self) -> &'static str {
        "CloseApp"
    }

    fn apdu(&self) -> Result<ApduCommand, ApduError> {
        Ok(ApduCommand::new(CLA_BOLOS, INS_CLOSE_APP, 0x00, 0x00))
    }

    fn parse(&self, response: &ApduResponse) -> Result<(), ApduError> {
        expect_empty(self.name(), response)
    }
}

/// Launch an installed application from the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenApp {
    pub name: String,
}

impl OpenApp {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Command for OpenApp {
    type Output = ();

    fn name(&self) -> &'static str {
        "OpenApp"
    }

    fn apdu(&self) -> Result<ApduCommand, ApduError> {
        let mut builder = ApduBuilder::new(CLA_DASHBOARD, INS_OPEN_APP, 0x00, 0x00);
        builder.add_ascii(&self.name)?;
        Ok(builder.build())
    }

    fn parse(&self, response: &ApduResponse) -> Result<(), ApduError> {
        expect_empty(self.name(), response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_reply(name: &str, version: &str, flags: Option<&[u8]>) -> ApduResponse {
        let mut data = vec![APP_AND_VERSION_FORMAT, name.len() as u8];
        data.extend_from_slice(name.as_bytes());
        data.push(version.len() as u8);
        data.extend_from_slice(version.as_bytes());
        if let Some(flags) = flags {
            data.push(flags.len() as u8);
            data.extend_from_slice(flags);
        }
        ApduResponse::new(data, SW_OK)
    }

    #[test]
    fn test_get_app_and_version_apdu() {
        assert_eq!(GetAppAndVersion.apdu().unwrap().encode().unwrap(), vec![0xB0, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_app_and_version() {
        let parsed = GetAppAndVersion
            .parse(&app_reply("Bitcoin", "2.1.0", Some(&[0x02])))
            .unwrap();
        assert_eq!(parsed.name, "Bitcoin");
        assert_eq!(parsed.version, "2.1.0");
        assert_eq!(parsed.flags, Some(vec![0x02]));
        assert_eq!(parsed.app_info().unwrap().name, "Bitcoin");

        let dashboard = GetAppAndVersion.parse(&app_reply("BOLOS", "2.2.3", None)).unwrap();
        assert!(dashboard.is_dashboard());
        assert_eq!(dashboard.flags, None);
        assert!(dashboard.app_info().is_none());
    }

    #[test]
    fn test_parse_rejects_bad_format() {
        let mut reply = app_reply("Bitcoin", "2.1.0", None);
        reply.data[0] = 0x02;
        assert!(GetAppAndVersion.parse(&reply).unwrap_err().is_decoding());

        let truncated = ApduResponse::new(vec![0x01, 0x07, b'B'], SW_OK);
        assert!(GetAppAndVersion.parse(&truncated).unwrap_err().is_decoding());
    }

    #[test]
    fn test_open_app_apdu() {
        let frame = OpenApp::new("Ethereum").apdu().unwrap().encode().unwrap();
        assert_eq!(&frame[..5], &[0xE0, 0xD8, 0x00, 0x00, 0x08]);
        assert_eq!(&frame[5..], b"Ethereum");

        let too_long = OpenApp::new("x".repeat(256));
        assert!(too_long.apdu().unwrap_err().is_encoding());
    }

    #[test]
    fn test_close_app() {
        assert_eq!(CloseApp.apdu().unwrap().encode().unwrap(), vec![0xB0, 0xA7, 0x00, 0x00, 0x00]);
        assert!(CloseApp.parse(&ApduResponse::new(Vec::new(), SW_OK)).is_ok());
        assert!(CloseApp.parse(&ApduResponse::new(vec![1], SW_OK)).is_err());
    }
}
