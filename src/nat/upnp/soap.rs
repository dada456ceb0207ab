//! SOAP control of a WANIPConnection / WANPPPConnection service

use std::borrow::Cow;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use xmltree::{Element, XMLNode};

use super::{IgdControl, IgdStatus, PortMappingEntry};
use crate::nat::error::UpnpError;
use crate::protocol::PortSpec;

const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

/// IGD control endpoint reached over HTTP/SOAP
#[derive(Debug, Clone)]
pub struct SoapIgd {
    http: reqwest::Client,
    control_url: String,
    service_type: String,
}

impl SoapIgd {
    pub fn new(control_url: impl Into<String>, service_type: impl Into<String>) -> Result<Self, UpnpError> {
        let http = reqwest::Client::builder().timeout(SOAP_TIMEOUT).build()?;
        Ok(Self {
            http,
            control_url: control_url.into(),
            service_type: service_type.into(),
        })
    }

    pub fn control_url(&self) -> &str {
        &self.control_url
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// WAN connection status (`GetStatusInfo`)
    pub async fn status(&self) -> Result<IgdStatus, UpnpError> {
        let response = self.invoke("GetStatusInfo", &[]).await?;
        let status = child_text(&response, "NewConnectionStatus").unwrap_or_default();
        Ok(if status == "Connected" {
            IgdStatus::Connected
        } else {
            IgdStatus::Disconnected
        })
    }

    /// Run one action and return its `<ActionResponse>` element
    async fn invoke(&self, action: &str, args: &[(&str, String)]) -> Result<Element, UpnpError> {
        let body = build_envelope(&self.service_type, action, args);

        let response = self
            .http
            .post(&self.control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{}\"", self.service_type, action))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            if let Some(fault) = parse_fault(&text) {
                return Err(fault);
            }
            return Err(UpnpError::HttpError {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        parse_action_response(&text, action)
    }
}

#[async_trait]
impl IgdControl for SoapIgd {
    async fn specific_port_mapping(&self, spec: PortSpec) -> Result<PortMappingEntry, UpnpError> {
        let response = self
            .invoke(
                "GetSpecificPortMappingEntry",
                &[
                    ("NewRemoteHost", String::new()),
                    ("NewExternalPort", spec.port.to_string()),
                    ("NewProtocol", spec.transport.as_str().to_string()),
                ],
            )
            .await?;

        let internal_client = child_text(&response, "NewInternalClient")
            .ok_or_else(|| UpnpError::InvalidResponse("missing NewInternalClient".to_string()))?;

        Ok(PortMappingEntry {
            internal_client,
            internal_port: child_text(&response, "NewInternalPort")
                .and_then(|p| p.parse().ok())
                .unwrap_or(spec.port),
            description: child_text(&response, "NewPortMappingDescription").unwrap_or_default(),
            enabled: child_text(&response, "NewEnabled").as_deref() != Some("0"),
            lease_duration: child_text(&response, "NewLeaseDuration")
                .and_then(|l| l.parse().ok())
                .unwrap_or(0),
        })
    }

    async fn add_port_mapping(
        &self,
        spec: PortSpec,
        internal_client: Ipv4Addr,
        description: &str,
        lease_secs: u32,
    ) -> Result<(), UpnpError> {
        self.invoke(
            "AddPortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", spec.port.to_string()),
                ("NewProtocol", spec.transport.as_str().to_string()),
                ("NewInternalPort", spec.port.to_string()),
                ("NewInternalClient", internal_client.to_string()),
                ("NewEnabled", "1".to_string()),
                ("NewPortMappingDescription", description.to_string()),
                ("NewLeaseDuration", lease_secs.to_string()),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn delete_port_mapping(&self, spec: PortSpec) -> Result<(), UpnpError> {
        self.invoke(
            "DeletePortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", spec.port.to_string()),
                ("NewProtocol", spec.transport.as_str().to_string()),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn external_ip(&self) -> Result<Ipv4Addr, UpnpError> {
        let response = self.invoke("GetExternalIPAddress", &[]).await?;
        let ip = child_text(&response, "NewExternalIPAddress")
            .ok_or_else(|| UpnpError::InvalidResponse("missing NewExternalIPAddress".to_string()))?;
        ip.trim()
            .parse()
            .map_err(|_| UpnpError::InvalidResponse(format!("invalid external address {:?}", ip)))
    }
}

fn build_envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut arguments = String::new();
    for (name, value) in args {
        arguments.push_str(&format!("<{0}>{1}</{0}>", name, xml_escape(value)));
    }

    format!(
        "<?xml version=\"1.0\"?>\r\n\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{service_type}\">{arguments}</u:{action}></s:Body>\
         </s:Envelope>\r\n"
    )
}

fn xml_escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|c| c.get_text())
        .map(|t| t.trim().to_string())
}

fn body_children(root: &Element) -> impl Iterator<Item = &Element> {
    root.get_child("Body")
        .into_iter()
        .flat_map(|body| body.children.iter())
        .filter_map(|node| match node {
            XMLNode::Element(e) => Some(e),
            _ => None,
        })
}

fn parse_action_response(xml: &str, action: &str) -> Result<Element, UpnpError> {
    let root = Element::parse(xml.as_bytes())?;
    let expected = format!("{}Response", action);

    if let Some(response) = body_children(&root).find(|e| e.name == expected) {
        return Ok(response.clone());
    }

    // Some devices answer faults with 200 OK
    if let Some(fault) = parse_fault(xml) {
        return Err(fault);
    }

    Err(UpnpError::InvalidResponse(format!("no {} in SOAP body", expected)))
}

/// Extract `<UPnPError>` from a SOAP fault body
fn parse_fault(xml: &str) -> Option<UpnpError> {
    let root = Element::parse(xml.as_bytes()).ok()?;
    let fault = body_children(&root).find(|e| e.name == "Fault")?;
    let upnp_error = fault.get_child("detail")?.get_child("UPnPError")?;

    let code = child_text(upnp_error, "errorCode")?.parse().ok()?;
    let description = child_text(upnp_error, "errorDescription").unwrap_or_default();

    Some(UpnpError::SoapFault { code, description })
}
