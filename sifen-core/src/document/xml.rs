//! libxml helpers shared by the signer, the packager and the auto-fixer.
pub(crate) mod constants;

use libxml::{
    parser::Parser,
    tree::{Document, Node, c14n},
    xpath,
};

use constants::{DS_NS, SIFEN_NS, SOAP12_NS};

pub(crate) fn parse(xml: &str) -> Result<Document, String> {
    Parser::default()
        .parse_string(xml)
        .map_err(|e| format!("XML parse error: {e:?}"))
}

pub(crate) fn context(doc: &Document) -> Result<xpath::Context, String> {
    let ctx = xpath::Context::new(doc).map_err(|e| format!("XPath context error: {e:?}"))?;
    ctx.register_namespace("s", SIFEN_NS)
        .map_err(|e| format!("XPath context error: {e:?}"))?;
    ctx.register_namespace("ds", DS_NS)
        .map_err(|e| format!("XPath context error: {e:?}"))?;
    ctx.register_namespace("soap", SOAP12_NS)
        .map_err(|e| format!("XPath context error: {e:?}"))?;
    Ok(ctx)
}

pub(crate) fn nodes(ctx: &xpath::Context, expr: &str) -> Result<Vec<Node>, String> {
    Ok(ctx
        .evaluate(expr)
        .map_err(|e| format!("XPath error for {expr}: {e:?}"))?
        .get_nodes_as_vec())
}

pub(crate) fn first_node(ctx: &xpath::Context, expr: &str) -> Result<Option<Node>, String> {
    Ok(nodes(ctx, expr)?.into_iter().next())
}

/// Trimmed text of the first match, `None` when absent or blank.
pub(crate) fn text(ctx: &xpath::Context, expr: &str) -> Result<Option<String>, String> {
    Ok(first_node(ctx, expr)?
        .map(|node| node.get_content().trim().to_string())
        .filter(|value| !value.is_empty()))
}

pub(crate) fn import_fragment(doc: &mut Document, xml: &str) -> Result<Node, String> {
    let fragment = parse(xml)?;
    let mut node = fragment
        .get_root_element()
        .ok_or_else(|| "missing fragment root".to_string())?;
    node.unlink();
    doc.import_node(&mut node)
        .map_err(|_| "failed to import fragment".to_string())
}

pub(crate) fn first_element_child(node: &Node) -> Option<Node> {
    let mut current = node.get_first_child();
    while let Some(child) = current {
        if child.is_element_node() {
            return Some(child);
        }
        current = child.get_next_sibling();
    }
    None
}

pub(crate) fn next_element_sibling(node: &Node) -> Option<Node> {
    let mut current = node.get_next_sibling();
    while let Some(sibling) = current {
        if sibling.is_element_node() {
            return Some(sibling);
        }
        current = sibling.get_next_sibling();
    }
    None
}

pub(crate) fn element_children(node: &Node) -> Vec<Node> {
    node.get_child_nodes()
        .into_iter()
        .filter(|child| child.is_element_node())
        .collect()
}

pub(crate) fn namespace_href(node: &Node) -> Option<String> {
    node.get_namespace().map(|ns| ns.get_href())
}

/// Serializes one element without the XML declaration and without indentation.
pub(crate) fn compact(doc: &Document, node: &Node) -> String {
    doc.node_to_string(node)
}

/// Document serialization without the leading `<?xml ...?>` line.
pub(crate) fn compact_root(doc: &Document) -> Result<String, String> {
    let root = doc
        .get_root_element()
        .ok_or_else(|| "document has no root element".to_string())?;
    Ok(compact(doc, &root))
}

/// Exclusive canonicalization (without comments) of one element subtree.
pub(crate) fn exclusive_c14n(node: &mut Node) -> Result<String, String> {
    let options = c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::ExclusiveCanonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    };
    node.canonicalize(options)
        .map_err(|e| format!("Failed to canonicalize {}: {e:?}", node.get_name()))
}

/// New element named `name` in the namespace of `like`, holding `content`.
/// Reusing the existing namespace avoids a redundant `xmlns` on the new node.
pub(crate) fn new_element_like(
    doc: &Document,
    like: &Node,
    name: &str,
    content: &str,
) -> Result<Node, String> {
    let mut node = Node::new(name, like.get_namespace(), doc)
        .map_err(|_| format!("failed to create element {name}"))?;
    if !content.is_empty() {
        node.set_content(content)
            .map_err(|e| format!("failed to set {name}: {e}"))?;
    }
    Ok(node)
}

/// Child element of `parent` with the given local name.
pub(crate) fn child_named(parent: &Node, name: &str) -> Option<Node> {
    element_children(parent)
        .into_iter()
        .find(|child| child.get_name() == name)
}
