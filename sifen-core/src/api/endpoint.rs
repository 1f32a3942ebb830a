//! Endpoint resolution: configured override, known table, then WSDL discovery.
use quick_xml::{
    events::{BytesStart, Event},
    name::{Namespace, ResolveResult},
    reader::NsReader,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};
use tracing::debug;

use super::{HttpReply, TransportError};
use crate::config::{Config, Operation};

const WSDL_SOAP12_NS: &[u8] = b"http://schemas.xmlsoap.org/wsdl/soap12/";
const WSDL_SOAP11_NS: &[u8] = b"http://schemas.xmlsoap.org/wsdl/soap/";

/// Where an endpoint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    Configured,
    Known,
    Discovered,
}

/// Finds the URL to post each operation to.
#[derive(Debug)]
pub struct EndpointResolver {
    base_url: String,
    overrides: BTreeMap<Operation, String>,
    use_known: bool,
    discovered: Mutex<HashMap<Operation, String>>,
}

impl EndpointResolver {
    pub fn new(config: &Config) -> Self {
        let overrides = [
            Operation::RecibeLote,
            Operation::ConsultaLote,
            Operation::ConsultaDe,
        ]
        .into_iter()
        .filter_map(|op| config.endpoint_override(op).map(|url| (op, url.to_string())))
        .collect();
        Self {
            base_url: config.base_url(),
            overrides,
            use_known: config.use_known_endpoints(),
            discovered: Mutex::new(HashMap::new()),
        }
    }

    /// Known endpoint for an operation, without any network traffic.
    pub fn known(&self, operation: Operation) -> String {
        format!("{}{}", self.base_url, operation.wsdl_path())
    }

    /// Service description URL used for discovery.
    pub fn description_url(&self, operation: Operation) -> String {
        format!("{}?wsdl", self.known(operation))
    }

    /// Resolves without the network; `None` when discovery would be needed.
    pub fn resolve_offline(&self, operation: Operation) -> Option<(String, EndpointSource)> {
        if let Some(url) = self.overrides.get(&operation) {
            return Some((url.clone(), EndpointSource::Configured));
        }
        if self.use_known {
            return Some((self.known(operation), EndpointSource::Known));
        }
        self.discovered
            .lock()
            .ok()
            .and_then(|cache| cache.get(&operation).cloned())
            .map(|url| (url, EndpointSource::Discovered))
    }

    /// Validates a fetched service description, extracts the SOAP address and
    /// caches it for later calls.
    pub fn accept_description(
        &self,
        operation: Operation,
        reply: &HttpReply,
    ) -> Result<String, TransportError> {
        if !(200..300).contains(&reply.status) {
            return Err(TransportError::Discovery {
                operation,
                reason: format!("service description returned HTTP {}", reply.status),
            });
        }
        let text = String::from_utf8_lossy(&reply.body);
        let endpoint = soap_address(&text).map_err(|reason| TransportError::Discovery { operation, reason })?;
        debug!(%operation, %endpoint, "discovered endpoint");
        if let Ok(mut cache) = self.discovered.lock() {
            cache.insert(operation, endpoint.clone());
        }
        Ok(endpoint)
    }
}

/// Extracts the SOAP 1.2 `address/@location` from a WSDL document, falling back
/// to a SOAP 1.1 address when that is all the description offers.
pub fn soap_address(wsdl: &str) -> Result<String, String> {
    let mut reader = NsReader::from_str(wsdl);
    let mut soap11 = None;
    loop {
        let (ns, event) = reader
            .read_resolved_event()
            .map_err(|e| format!("unreadable service description: {e}"))?;
        match event {
            Event::Start(ref element) | Event::Empty(ref element)
                if element.local_name().as_ref() == b"address" =>
            {
                let ResolveResult::Bound(Namespace(uri)) = ns else {
                    continue;
                };
                if uri == WSDL_SOAP12_NS {
                    return location(element);
                }
                if uri == WSDL_SOAP11_NS && soap11.is_none() {
                    soap11 = Some(location(element)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    soap11.ok_or_else(|| "service description has no soap address".to_string())
}

fn location(element: &BytesStart<'_>) -> Result<String, String> {
    let attribute = element
        .try_get_attribute("location")
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "soap address without location".to_string())?;
    let value = attribute.unescape_value().map_err(|e| e.to_string())?;
    Ok(value.trim().to_string())
}
