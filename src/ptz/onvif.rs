//! Minimal ONVIF SOAP transport: device address resolution, connection
//! caching under multiple alias keys, and the handful of PTZ/media requests
//! the controller needs. Grounded in
//! `original_source/backend/services/ptz_service.py`'s
//! `get_onvif_camera`/`move_to_preset`/`set_preset`/`get_current_position`.
//!
//! ONVIF normally authenticates with a WS-UsernameToken digest; this client
//! uses HTTP Basic auth instead, which the large majority of consumer PTZ
//! cameras accept on their SOAP endpoints. See `DESIGN.md` for the tradeoff.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

const FALLBACK_PORTS: &[u16] = &[8899, 8000, 80];

/// A resolved, cached ONVIF endpoint pair (device + PTZ service) for one
/// camera. `media_profile_token` is lazily discovered on first use.
#[derive(Debug, Clone)]
pub struct OnvifConnection {
    pub device_url: String,
    pub ptz_url: String,
    pub media_url: String,
    pub username: String,
    pub password: String,
}

/// Caches one connection per `(host, port)`, registered under extra alias
/// keys (the address/port pair the caller originally asked for, and any
/// fallback port that actually worked) so repeated lookups with slightly
/// different keys still hit the cache, per §4.4 and §5.
pub struct OnvifClient {
    http: Client,
    connections: Mutex<HashMap<String, OnvifConnection>>,
    device_url_override: Option<String>,
    ptz_url_override: Option<String>,
}

impl OnvifClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder().timeout(Duration::from_secs(15)).build().unwrap_or_default(),
            connections: Mutex::new(HashMap::new()),
            device_url_override: std::env::var("ONVIF_DEVICE_URL").ok(),
            ptz_url_override: std::env::var("ONVIF_PTZ_URL").ok(),
        }
    }

    /// Returns a cached connection or probes candidate ports in order:
    /// explicit override, configured port, then the common fallback list.
    pub async fn get_onvif_camera(
        &self,
        address: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<OnvifConnection> {
        let cache_keys = [format!("{address}:{port}")];
        for key in &cache_keys {
            if let Some(conn) = self.connections.lock().get(key).cloned() {
                debug!(cache_key = %key, "reusing cached ONVIF connection");
                return Ok(conn);
            }
        }

        if let Some(device_url) = &self.device_url_override {
            let conn = OnvifConnection {
                device_url: device_url.clone(),
                ptz_url: self.ptz_url_override.clone().unwrap_or_else(|| device_url.replace("device_service", "ptz_service")),
                media_url: device_url.replace("device_service", "media_service"),
                username: username.to_string(),
                password: password.to_string(),
            };
            self.register(&cache_keys, address, port, &conn);
            return Ok(conn);
        }

        let mut candidates = vec![port];
        candidates.extend(FALLBACK_PORTS.iter().copied().filter(|p| *p != port));

        let mut last_error = None;
        for candidate in candidates {
            let device_url = format!("http://{address}:{candidate}/onvif/device_service");
            match self.probe(&device_url).await {
                Ok(()) => {
                    let conn = OnvifConnection {
                        device_url: device_url.clone(),
                        ptz_url: format!("http://{address}:{candidate}/onvif/ptz_service"),
                        media_url: format!("http://{address}:{candidate}/onvif/media_service"),
                        username: username.to_string(),
                        password: password.to_string(),
                    };
                    if candidate != port {
                        info!(address, candidate, original_port = port, "ONVIF connected via fallback port");
                    } else {
                        info!(address, candidate, "ONVIF connection established");
                    }
                    self.register(&cache_keys, address, candidate, &conn);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(address, candidate, error = %e, "ONVIF probe failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| EngineError::Onvif("unable to establish ONVIF connection".into())))
    }

    fn register(&self, extra_keys: &[String], address: &str, resolved_port: u16, conn: &OnvifConnection) {
        let mut conns = self.connections.lock();
        for key in extra_keys {
            conns.insert(key.clone(), conn.clone());
        }
        conns.insert(format!("{address}:{resolved_port}"), conn.clone());
    }

    async fn probe(&self, device_url: &str) -> Result<()> {
        let body = soap_envelope("<GetSystemDateAndTime xmlns=\"http://www.onvif.org/ver10/device/wsdl\"/>");
        self.http
            .post(device_url)
            .header("Content-Type", "application/soap+xml")
            .body(body)
            .send()
            .await
            .map_err(EngineError::from)?
            .error_for_status()
            .map_err(EngineError::from)?;
        Ok(())
    }

    async fn soap_call(&self, conn: &OnvifConnection, url: &str, body: &str) -> Result<String> {
        let envelope = soap_envelope(body);
        let resp = self
            .http
            .post(url)
            .basic_auth(&conn.username, Some(&conn.password))
            .header("Content-Type", "application/soap+xml")
            .body(envelope)
            .send()
            .await
            .map_err(EngineError::from)?;
        let status = resp.status();
        let text = resp.text().await.map_err(EngineError::from)?;
        if !status.is_success() {
            return Err(EngineError::Onvif(format!("SOAP call failed: HTTP {status}")));
        }
        Ok(text)
    }

    /// `GetProfiles` against the media service; returns profile tokens in
    /// document order. The first token is used for all PTZ operations.
    pub async fn get_profiles(&self, conn: &OnvifConnection) -> Result<Vec<String>> {
        let body = "<GetProfiles xmlns=\"http://www.onvif.org/ver10/media/wsdl\"/>";
        let xml = self.soap_call(conn, &conn.media_url, body).await?;
        Ok(extract_attr_values(&xml, "Profiles", "token"))
    }

    pub async fn absolute_move(&self, conn: &OnvifConnection, profile_token: &str, pan: f64, tilt: f64, zoom: f64) -> Result<()> {
        let body = format!(
            "<AbsoluteMove xmlns=\"http://www.onvif.org/ver20/ptz/wsdl\">\
               <ProfileToken>{profile_token}</ProfileToken>\
               <Position>\
                 <PanTilt xmlns=\"http://www.onvif.org/ver10/schema\" x=\"{pan}\" y=\"{tilt}\"/>\
                 <Zoom xmlns=\"http://www.onvif.org/ver10/schema\" x=\"{zoom}\"/>\
               </Position>\
             </AbsoluteMove>"
        );
        self.soap_call(conn, &conn.ptz_url, &body).await?;
        Ok(())
    }

    pub async fn goto_preset(&self, conn: &OnvifConnection, profile_token: &str, preset_token: &str) -> Result<()> {
        let body = format!(
            "<GotoPreset xmlns=\"http://www.onvif.org/ver20/ptz/wsdl\">\
               <ProfileToken>{profile_token}</ProfileToken>\
               <PresetToken>{preset_token}</PresetToken>\
             </GotoPreset>"
        );
        self.soap_call(conn, &conn.ptz_url, &body).await?;
        Ok(())
    }

    pub async fn set_preset(
        &self,
        conn: &OnvifConnection,
        profile_token: &str,
        preset_name: &str,
        preset_token: Option<&str>,
    ) -> Result<String> {
        let token_elem = preset_token.map(|t| format!("<PresetToken>{t}</PresetToken>")).unwrap_or_default();
        let body = format!(
            "<SetPreset xmlns=\"http://www.onvif.org/ver20/ptz/wsdl\">\
               <ProfileToken>{profile_token}</ProfileToken>\
               {token_elem}\
               <PresetName>{preset_name}</PresetName>\
             </SetPreset>"
        );
        let xml = self.soap_call(conn, &conn.ptz_url, &body).await?;
        extract_single_attr(&xml, "SetPresetResponse", "PresetToken")
            .or_else(|| preset_token.map(str::to_string))
            .ok_or_else(|| EngineError::Onvif("camera did not provide a preset token".into()))
    }

    pub async fn get_status(&self, conn: &OnvifConnection, profile_token: &str) -> Result<(f64, f64, f64)> {
        let body = format!(
            "<GetStatus xmlns=\"http://www.onvif.org/ver20/ptz/wsdl\">\
               <ProfileToken>{profile_token}</ProfileToken>\
             </GetStatus>"
        );
        let xml = self.soap_call(conn, &conn.ptz_url, &body).await?;
        let pan = extract_attr_f64(&xml, "PanTilt", "x").unwrap_or(0.0);
        let tilt = extract_attr_f64(&xml, "PanTilt", "y").unwrap_or(0.0);
        let zoom = extract_attr_f64(&xml, "Zoom", "x").unwrap_or(1.0);
        Ok((pan, tilt, zoom))
    }
}

impl Default for OnvifClient {
    fn default() -> Self {
        Self::new()
    }
}

fn soap_envelope(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\">\
           <s:Body>{body}</s:Body>\
         </s:Envelope>"
    )
}

/// Scans the response for `<local_name .. attr="value" ..>` occurrences
/// inside a given parent element; tolerant of namespace prefixes since ONVIF
/// responses vary in how they're applied.
fn extract_attr_values(xml: &str, _parent_hint: &str, attr: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut values = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let local = local_name(&e.name().as_ref());
                if local == "Profiles" || local == "Profile" {
                    for a in e.attributes().flatten() {
                        if local_name(a.key.as_ref()) == attr {
                            if let Ok(v) = a.unescape_value() {
                                values.push(v.into_owned());
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    values
}

fn extract_single_attr(xml: &str, element_hint: &str, attr: &str) -> Option<String> {
    extract_attr_values(xml, element_hint, attr).into_iter().next()
}

fn extract_attr_f64(xml: &str, element: &str, attr: &str) -> Option<f64> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == element {
                    for a in e.attributes().flatten() {
                        if local_name(a.key.as_ref()) == attr {
                            if let Ok(v) = a.unescape_value() {
                                return v.parse().ok();
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

fn local_name(qualified: &[u8]) -> &str {
    let s = std::str::from_utf8(qualified).unwrap_or("");
    s.rsplit(':').next().unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_profile_tokens() {
        let xml = r#"<Envelope><Body><GetProfilesResponse>
            <Profiles token="profile_1"/>
            <Profiles token="profile_2"/>
        </GetProfilesResponse></Body></Envelope>"#;
        assert_eq!(extract_attr_values(xml, "Profiles", "token"), vec!["profile_1", "profile_2"]);
    }

    #[test]
    fn extracts_pan_tilt_zoom_status() {
        let xml = r#"<Envelope><Body><GetStatusResponse><PTZStatus>
            <Position><PanTilt x="0.25" y="-0.5"/><Zoom x="0.8"/></Position>
        </PTZStatus></GetStatusResponse></Body></Envelope>"#;
        assert_eq!(extract_attr_f64(xml, "PanTilt", "x"), Some(0.25));
        assert_eq!(extract_attr_f64(xml, "PanTilt", "y"), Some(-0.5));
        assert_eq!(extract_attr_f64(xml, "Zoom", "x"), Some(0.8));
    }
}
