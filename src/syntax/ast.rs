// SPDX-License-Identifier: PMPL-1.0-or-later

//! AST-node multisets via the tree-sitter C++ grammar.

use anyhow::{Context, Result};
use tree_sitter::{Node, Parser};

/// Textual forms of every node of the function's AST, collected by
/// depth-first preorder traversal (the root's text comes first).
pub fn ast_nodes(code: &str) -> Result<Vec<String>> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_cpp::language())
        .context("loading the tree-sitter C++ grammar")?;
    let tree = parser
        .parse(code, None)
        .context("tree-sitter could not parse the function")?;
    let mut nodes = Vec::new();
    collect(tree.root_node(), code.as_bytes(), &mut nodes);
    Ok(nodes)
}

fn collect(node: Node<'_>, source: &[u8], out: &mut Vec<String>) {
    out.push(node.utf8_text(source).unwrap_or("").to_string());
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            collect(child, source, out);
        }
    }
}
