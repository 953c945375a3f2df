//! JSON-RPC tool surface over stdio.
//!
//! Line-delimited JSON-RPC 2.0 for editor/assistant integrations:
//! `initialize`, `tools/list`, and `tools/call` over the tools
//! `search_docs`, `get_snippets`, `index_docs`, `index_status`. Each
//! request line gets exactly one response line with the request `id`
//! echoed; notifications (no `id`) get none. Unknown methods and tools
//! answer code −32601, internal failures −32603. Logging goes to stderr
//! — stdout carries only protocol frames.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::ingest::{IndexRequest, Oracle};
use crate::search::SearchRequest;

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INTERNAL_ERROR: i64 = -32603;

/// Serve JSON-RPC on stdin/stdout until EOF.
pub async fn run_stdio(oracle: Arc<Oracle>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&oracle, line).await {
            stdout.write_all(response.to_string().as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

async fn handle_line(oracle: &Arc<Oracle>, line: &str) -> Option<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Some(error_response(
                Value::Null,
                PARSE_ERROR,
                &format!("parse error: {}", e),
            ))
        }
    };

    let id = request.get("id").cloned();
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    // Notifications get no response.
    let id = match id {
        Some(id) => id,
        None => return None,
    };

    let response = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {
                "name": "mem-oracle",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {} },
        })),
        "tools/list" => Ok(json!({ "tools": tool_definitions() })),
        "tools/call" => call_tool(oracle, &params).await,
        _ => Err((METHOD_NOT_FOUND, format!("method not found: {}", method))),
    };

    Some(match response {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => error_response(id, code, &message),
    })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "search_docs",
            "description": "Search indexed documentation and return ranked snippets with scores.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Natural-language query" },
                    "docsetIds": { "type": "array", "items": { "type": "string" } },
                    "topK": { "type": "integer", "minimum": 1, "maximum": 100 },
                },
                "required": ["query"],
            },
        },
        {
            "name": "get_snippets",
            "description": "Fetch formatted documentation snippets for a query, ready for a model context window.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "docsetIds": { "type": "array", "items": { "type": "string" } },
                    "maxTotalChars": { "type": "integer", "minimum": 1000, "maximum": 500000 },
                },
                "required": ["query"],
            },
        },
        {
            "name": "index_docs",
            "description": "Start indexing a documentation site from a base URL and seed path.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "baseUrl": { "type": "string" },
                    "seedSlug": { "type": "string" },
                    "name": { "type": "string" },
                },
                "required": ["baseUrl", "seedSlug"],
            },
        },
        {
            "name": "index_status",
            "description": "Report indexing progress for one docset or all docsets.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "docsetId": { "type": "string" },
                },
            },
        },
    ])
}

async fn call_tool(oracle: &Arc<Oracle>, params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let rendered = match name {
        "search_docs" => tool_search_docs(oracle, &arguments).await,
        "get_snippets" => tool_get_snippets(oracle, &arguments).await,
        "index_docs" => tool_index_docs(oracle, &arguments).await,
        "index_status" => tool_index_status(oracle, &arguments).await,
        _ => return Err((METHOD_NOT_FOUND, format!("unknown tool: {}", name))),
    };

    match rendered {
        Ok(text) => Ok(json!({ "content": [{ "type": "text", "text": text }] })),
        Err(e) => Err((INTERNAL_ERROR, format!("{:#}", e))),
    }
}

fn string_arg(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn string_list_arg(arguments: &Value, key: &str) -> Option<Vec<String>> {
    arguments.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}

async fn tool_search_docs(oracle: &Arc<Oracle>, arguments: &Value) -> Result<String> {
    let query = string_arg(arguments, "query").unwrap_or_default();
    let response = oracle
        .search(SearchRequest {
            query,
            docset_ids: string_list_arg(arguments, "docsetIds"),
            top_k: arguments.get("topK").and_then(|v| v.as_u64()).map(|v| v as usize),
            format_snippets: Some(true),
            ..Default::default()
        })
        .await?;

    if response.results.is_empty() {
        return Ok("No results.".to_string());
    }

    let mut out = String::new();
    for (i, hit) in response.results.iter().enumerate() {
        out.push_str(&format!("{}. [{:.3}] {}\n", i + 1, hit.score, hit.url));
        if let Some(snippet) = &hit.snippet {
            out.push_str(&snippet.formatted);
        } else {
            out.push_str(&hit.content);
        }
        out.push_str("\n\n");
    }
    Ok(out.trim_end().to_string())
}

async fn tool_get_snippets(oracle: &Arc<Oracle>, arguments: &Value) -> Result<String> {
    let query = string_arg(arguments, "query").unwrap_or_default();
    let response = oracle
        .search(SearchRequest {
            query,
            docset_ids: string_list_arg(arguments, "docsetIds"),
            max_total_chars: arguments
                .get("maxTotalChars")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
            format_snippets: Some(true),
            ..Default::default()
        })
        .await?;

    if response.results.is_empty() {
        return Ok("No results.".to_string());
    }

    let snippets: Vec<String> = response
        .results
        .iter()
        .map(|hit| match &hit.snippet {
            Some(snippet) => snippet.formatted.clone(),
            None => hit.content.clone(),
        })
        .collect();
    Ok(snippets.join("\n\n---\n\n"))
}

async fn tool_index_docs(oracle: &Arc<Oracle>, arguments: &Value) -> Result<String> {
    let base_url = string_arg(arguments, "baseUrl").unwrap_or_default();
    let seed_slug = string_arg(arguments, "seedSlug").unwrap_or_default();
    if base_url.is_empty() || seed_slug.is_empty() {
        anyhow::bail!("baseUrl and seedSlug are required");
    }

    let (docset, _) = oracle
        .index_docset(
            IndexRequest {
                base_url,
                seed_path: seed_slug,
                name: string_arg(arguments, "name"),
                allowed_paths: None,
            },
            false,
        )
        .await?;

    Ok(format!(
        "Indexing started for {} (docset {}, status {}).",
        docset.base_url,
        docset.id,
        docset.status.as_str()
    ))
}

async fn tool_index_status(oracle: &Arc<Oracle>, arguments: &Value) -> Result<String> {
    let docsets = match string_arg(arguments, "docsetId") {
        Some(id) => match oracle.store().get_docset(&id).await? {
            Some(docset) => vec![docset],
            None => anyhow::bail!("docset not found: {}", id),
        },
        None => oracle.store().list_docsets().await?,
    };

    if docsets.is_empty() {
        return Ok("No docsets indexed yet.".to_string());
    }

    let mut out = String::new();
    for docset in docsets {
        let status = oracle.store().get_index_status(&docset.id).await?;
        out.push_str(&format!(
            "{} ({}) — {}: {}/{} pages indexed, {} pending, {} errors, {} chunks\n",
            docset.name,
            docset.id,
            docset.status.as_str(),
            status.indexed_pages,
            status.total_pages,
            status.pending_pages,
            status.error_pages,
            status.total_chunks,
        ));
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definitions_shape() {
        let tools = tool_definitions();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["search_docs", "get_snippets", "index_docs", "index_status"]
        );
        for tool in tools.as_array().unwrap() {
            assert!(tool["inputSchema"]["type"] == "object");
            assert!(tool["description"].as_str().unwrap().len() > 10);
        }
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(json!(7), METHOD_NOT_FOUND, "method not found: nope");
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 7);
        assert_eq!(response["error"]["code"], -32601);
    }
}
