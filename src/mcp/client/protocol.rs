use crate::core::config::McpServerConfig;
use crate::mcp::{McpContent, McpError, McpToolOutput};
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, PaginatedRequestParams, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

/// JSON-RPC internal error, used when a reply cannot be interpreted.
const MCP_INTERNAL_ERROR: i64 = -32603;

pub(crate) fn requested_protocol_version(config: &McpServerConfig) -> String {
    config
        .protocol_version
        .clone()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

pub(crate) fn client_details_for(config: &McpServerConfig) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "conduit".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Conduit MCP Client".to_string()),
            description: Some("Tool proxy for the conduit agent core".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: requested_protocol_version(config),
    }
}

pub(crate) fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, McpError> {
    let value = parse_response_value(message)?;
    let result = serde_json::from_value::<InitializeResult>(value).map_err(malformed)?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::Protocol {
            code: MCP_INTERNAL_ERROR,
            message: "Unexpected initialize response.".to_string(),
        });
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, McpError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<ListToolsResult>(value).map_err(malformed)
}

/// Interprets a `tools/call` result.
///
/// Structured content wins over the content blocks. Text blocks are kept
/// verbatim; any other block is carried as its JSON form.
pub(crate) fn parse_call_tool(message: ServerMessage) -> Result<McpToolOutput, McpError> {
    let value = parse_response_value(message)?;
    let is_error = value
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(structured) = value.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(McpToolOutput {
            content: McpContent::Object(structured.clone()),
            is_error,
        });
    }

    let mut fragments: Vec<String> = value
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| blocks.iter().map(content_block_text).collect())
        .unwrap_or_default();
    let content = if fragments.len() == 1 {
        McpContent::Text(fragments.remove(0))
    } else {
        McpContent::Fragments(fragments)
    };
    Ok(McpToolOutput { content, is_error })
}

fn content_block_text(block: &Value) -> String {
    match (block.get("type").and_then(Value::as_str), block.get("text")) {
        (Some("text"), Some(Value::String(text))) => text.clone(),
        _ => serde_json::to_string(block).unwrap_or_default(),
    }
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, McpError> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(malformed)
        }
        ServerMessage::Error(error) => Err(McpError::Protocol {
            code: error.error.code,
            message: format_rpc_error(&error.error),
        }),
        other => Err(McpError::Protocol {
            code: MCP_INTERNAL_ERROR,
            message: format!("Unexpected MCP server message: {other:?}"),
        }),
    }
}

fn malformed(err: serde_json::Error) -> McpError {
    McpError::Protocol {
        code: MCP_INTERNAL_ERROR,
        message: format!("Malformed MCP result: {err}"),
    }
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    let mut output = error.message.clone();
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}
