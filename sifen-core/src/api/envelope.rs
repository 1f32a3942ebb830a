//! SOAP 1.2 request envelopes.
use quick_xml::escape::escape;

use crate::document::xml::constants::{SIFEN_NS, SOAP12_NS};

fn wrap(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soap:Envelope xmlns:soap="{SOAP12_NS}"><soap:Header/><soap:Body>{body}</soap:Body></soap:Envelope>"#
    )
}

/// `rEnvioLote`: request id plus the base64 zip payload.
pub fn recibe_lote(request_id: &str, payload: &str) -> String {
    wrap(&format!(
        r#"<rEnvioLote xmlns="{SIFEN_NS}"><dId>{}</dId><xDE>{}</xDE></rEnvioLote>"#,
        escape(request_id),
        escape(payload)
    ))
}

/// `rEnviConsLoteDe`: status query by batch protocol number.
pub fn consulta_lote(request_id: &str, protocol: &str) -> String {
    wrap(&format!(
        r#"<rEnviConsLoteDe xmlns="{SIFEN_NS}"><dId>{}</dId><dProtConsLote>{}</dProtConsLote></rEnviConsLoteDe>"#,
        escape(request_id),
        escape(protocol)
    ))
}

/// `rEnviConsDeRequest`: single document lookup by CDC.
pub fn consulta_de(request_id: &str, cdc: &str) -> String {
    wrap(&format!(
        r#"<rEnviConsDeRequest xmlns="{SIFEN_NS}"><dId>{}</dId><dCDC>{}</dCDC></rEnviConsDeRequest>"#,
        escape(request_id),
        escape(cdc)
    ))
}
