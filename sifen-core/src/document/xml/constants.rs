pub(crate) const SIFEN_NS: &str = "http://ekuatia.set.gov.py/sifen/xsd";
pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub(crate) const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

pub(crate) const EXC_C14N_ALG: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub(crate) const ENVELOPED_ALG: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub(crate) const RSA_SHA256_ALG: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub(crate) const SHA256_ALG: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// `dVerFor` value carried as the first child of every `rDE`.
pub const FORMAT_VERSION: &str = "150";

/// Name of the single entry inside the zipped batch payload.
pub(crate) const BATCH_ENTRY_NAME: &str = "lote.xml";

pub(crate) const SIGNATURE_TEMPLATE: &str = r##"<Signature xmlns="http://www.w3.org/2000/09/xmldsig#"><SignedInfo><CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/><SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/><Reference URI="#{reference}"><Transforms><Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/><Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/></Transforms><DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/><DigestValue>{digest}</DigestValue></Reference></SignedInfo><SignatureValue></SignatureValue><KeyInfo><X509Data><X509Certificate></X509Certificate></X509Data></KeyInfo></Signature>"##;

pub(crate) const QR_TRAILER_TEMPLATE: &str =
    r#"<gCamFuFD xmlns="http://ekuatia.set.gov.py/sifen/xsd"><dCarQR>{qr}</dCarQR></gCamFuFD>"#;
