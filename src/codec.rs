//! Controller batch codec.
//!
//! Inbound batches look like:
//!
//! ```xml
//! <Commands xmlns="http://schemas.qualisystems.com/ResourceManagement/DriverCommands.xsd">
//!   <Command CommandName="Login" CommandId="567f4dc1">
//!     <Parameters><Address>192.168.42.240</Address><User>root</User><Password>root</Password></Parameters>
//!   </Command>
//! </Commands>
//! ```
//!
//! and are answered with a `Responses` envelope holding one `CommandResponse`
//! per command, in order.

use std::fmt::Write as _;

use crate::command::{BatchResult, CommandRequest, CommandResult, Parameters, ResponsePayload};
use crate::error::L1Error;

pub const RESPONSES_NS: &str =
    "http://schemas.qualisystems.com/ResourceManagement/DriverCommandResult.xsd";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Day.month.year 24h, zero padded.
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// One `Command` element after decoding. Shape errors stay local to the
/// element so siblings still decode.
#[derive(Debug)]
pub enum DecodedCommand {
    Request(CommandRequest),
    Invalid {
        id: String,
        name: String,
        error: L1Error,
    },
}

/// Decode a complete batch into per-command entries, in document order.
///
/// # Errors
///
/// Returns `L1Error::MalformedBatch` when the bytes are not UTF-8 or not
/// well-formed XML.
pub fn decode_batch(frame: &[u8]) -> Result<Vec<DecodedCommand>, L1Error> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| L1Error::MalformedBatch(format!("invalid UTF-8: {e}")))?;
    // the controller may send a line break or two between batches
    let doc = roxmltree::Document::parse(text.trim_start())
        .map_err(|e| L1Error::MalformedBatch(e.to_string()))?;

    Ok(doc
        .root_element()
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "Command")
        .map(|node| decode_command(&node))
        .collect())
}

fn decode_command(node: &roxmltree::Node) -> DecodedCommand {
    let id = node.attribute("CommandId");
    let name = node.attribute("CommandName");
    let (id, name) = match (id, name) {
        (Some(id), Some(name)) => (id, name),
        (id, name) => {
            let missing = if id.is_none() { "CommandId" } else { "CommandName" };
            return DecodedCommand::Invalid {
                id: id.unwrap_or_default().to_string(),
                name: name.unwrap_or_default().to_string(),
                error: L1Error::UnknownCommandShape(missing),
            };
        }
    };

    let mut parameters = Parameters::new();
    if let Some(block) = node
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "Parameters")
    {
        for p in block.children().filter(roxmltree::Node::is_element) {
            let value: String = p
                .children()
                .filter(|c| c.is_text())
                .filter_map(|c| c.text())
                .collect();
            parameters.push(p.tag_name().name(), value);
        }
    }
    DecodedCommand::Request(CommandRequest::new(id, name, parameters))
}

/// Escape text for use in XML content and double-quoted attributes.
#[must_use]
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn optional_block(tag: &str, text: Option<&str>) -> String {
    match text {
        Some(t) if !t.is_empty() => format!("<{tag}>{}</{tag}>", escape(t)),
        _ => format!("<{tag} />"),
    }
}

fn response_info(payload: &ResponsePayload) -> String {
    match payload {
        ResponsePayload::None => "<ResponseInfo />".to_string(),
        ResponsePayload::StateId(state_id) => format!(
            "<ResponseInfo xsi:type=\"StateInfo\" xmlns:xsi=\"{XSI_NS}\">\n                <StateId>{}</StateId>\n            </ResponseInfo>",
            escape(state_id)
        ),
        ResponsePayload::Attribute { name, value } => format!(
            "<ResponseInfo xsi:type=\"AttributeInfoResponse\" xmlns:xsi=\"{XSI_NS}\">\n                <Attribute Name=\"{}\" Type=\"String\" Value=\"{}\" />\n            </ResponseInfo>",
            escape(name),
            escape(value)
        ),
        ResponsePayload::Resource(info) => format!(
            "<ResponseInfo xsi:type=\"ResourceInfoResponse\" xmlns:xsi=\"{XSI_NS}\">\n{}            </ResponseInfo>",
            info.to_xml(4)
        ),
    }
}

fn encode_result(out: &mut String, r: &CommandResult) {
    // writes into a String cannot fail
    let _ = write!(
        out,
        "\n    <CommandResponse CommandId=\"{}\" CommandName=\"{}\" Success=\"{}\">\n        {}\n        {}\n        <Timestamp>{}</Timestamp>\n        {}\n    </CommandResponse>",
        escape(&r.id),
        escape(&r.name),
        r.succeeded,
        optional_block("Error", r.error_message.as_deref()),
        optional_block("Log", r.log_text.as_deref()),
        r.timestamp.format(TIMESTAMP_FORMAT),
        response_info(&r.payload),
    );
}

/// Encode a batch result into the `Responses` envelope sent to the controller.
#[must_use]
pub fn encode_batch(batch: &BatchResult) -> String {
    let ok = batch.overall_succeeded();
    let mut out = format!(
        "<Responses xmlns=\"{RESPONSES_NS}\" xmlns:xsi=\"{XSI_NS}\" Success=\"{ok}\">\n    {}\n    <Log></Log>",
        if ok {
            "<ErrorCode />"
        } else {
            "<ErrorCode>1</ErrorCode>"
        }
    );
    for r in &batch.results {
        encode_result(&mut out, r);
    }
    out.push_str("\n</Responses>\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceInfo;

    #[test]
    fn decodes_commands_in_order_with_namespace() {
        let xml = r#"
<Commands xmlns="http://schemas.qualisystems.com/ResourceManagement/DriverCommands.xsd">
  <Command CommandName="Login" CommandId="a1">
    <Parameters><Address>10.0.0.1</Address><User>u</User><Password>p</Password></Parameters>
  </Command>
  <Command CommandName="MapClear" CommandId="a2">
    <Parameters><MapPort>10.0.0.1/1</MapPort><MapPort>10.0.0.1/2</MapPort></Parameters>
  </Command>
  <Command CommandName="Logout" CommandId="a3" />
</Commands>"#;
        let cmds = decode_batch(xml.as_bytes()).expect("decode");
        assert_eq!(cmds.len(), 3);
        let DecodedCommand::Request(login) = &cmds[0] else {
            panic!("expected request");
        };
        assert_eq!(login.id, "a1");
        assert_eq!(login.parameters.get("User"), Some("u"));
        let DecodedCommand::Request(clear) = &cmds[1] else {
            panic!("expected request");
        };
        assert_eq!(clear.parameters.nth("MapPort", 1), Some("10.0.0.1/2"));
        let DecodedCommand::Request(logout) = &cmds[2] else {
            panic!("expected request");
        };
        assert!(logout.parameters.is_empty());
    }

    #[test]
    fn missing_attribute_is_local_to_element() {
        let xml = r#"<Commands>
  <Command CommandName="GetStateId"><Parameters /></Command>
  <Command CommandName="GetStateId" CommandId="2"><Parameters /></Command>
</Commands>"#;
        let cmds = decode_batch(xml.as_bytes()).expect("decode");
        assert!(matches!(
            &cmds[0],
            DecodedCommand::Invalid {
                error: L1Error::UnknownCommandShape("CommandId"),
                ..
            }
        ));
        assert!(matches!(&cmds[1], DecodedCommand::Request(r) if r.id == "2"));
    }

    #[test]
    fn malformed_markup_is_rejected() {
        let err = decode_batch(b"<Commands><Command CommandId=\"1\"></Commands>").unwrap_err();
        assert!(matches!(err, L1Error::MalformedBatch(_)));
    }

    #[test]
    fn empty_parameter_decodes_as_empty_string() {
        let xml = r#"<Commands><Command CommandName="MapBidi" CommandId="1"><Parameters>
<MapPort_A>a/1</MapPort_A><MapPort_B>a/2</MapPort_B><MappingGroupName /></Parameters></Command></Commands>"#;
        let cmds = decode_batch(xml.as_bytes()).expect("decode");
        let DecodedCommand::Request(r) = &cmds[0] else {
            panic!("expected request");
        };
        assert_eq!(r.parameters.get("MappingGroupName"), Some(""));
    }

    #[test]
    fn encode_sets_error_code_when_any_failed() {
        let batch = BatchResult::new(vec![
            CommandResult::success("1", "GetStateId", ResponsePayload::StateId("-1".into())),
            CommandResult::failure("2", "Bogus", "Unimplemented command Bogus", "trace <x>"),
        ]);
        let xml = encode_batch(&batch);
        assert!(xml.ends_with("</Responses>\r\n\r\n"));
        let doc = roxmltree::Document::parse(xml.trim_end()).expect("well formed");
        let root = doc.root_element();
        assert_eq!(root.attribute("Success"), Some("false"));
        let code = root
            .children()
            .find(|n| n.tag_name().name() == "ErrorCode")
            .and_then(|n| n.text());
        assert_eq!(code, Some("1"));
        let responses: Vec<_> = root
            .children()
            .filter(|n| n.tag_name().name() == "CommandResponse")
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].attribute("CommandId"), Some("2"));
        let log = responses[1]
            .children()
            .find(|n| n.tag_name().name() == "Log")
            .and_then(|n| n.text());
        assert_eq!(log, Some("trace <x>"));
        let state = responses[0]
            .descendants()
            .find(|n| n.tag_name().name() == "StateId")
            .and_then(|n| n.text());
        assert_eq!(state, Some("-1"));
    }

    #[test]
    fn encode_success_has_empty_error_blocks_and_timestamp() {
        let batch = BatchResult::new(vec![CommandResult::success(
            "x",
            "Login",
            ResponsePayload::None,
        )]);
        let xml = encode_batch(&batch);
        assert!(xml.contains("Success=\"true\""));
        assert!(xml.contains("<ErrorCode />"));
        assert!(xml.contains("<Error />"));
        assert!(xml.contains("<ResponseInfo />"));
        let doc = roxmltree::Document::parse(xml.trim_end()).expect("well formed");
        let ts = doc
            .descendants()
            .find(|n| n.tag_name().name() == "Timestamp")
            .and_then(|n| n.text())
            .expect("timestamp");
        // dd.mm.yyyy hh:mm:ss
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[2..3], ".");
        assert_eq!(&ts[5..6], ".");
        assert_eq!(&ts[13..14], ":");
    }

    #[test]
    fn resource_payload_is_nested() {
        let info = ResourceInfo::new("", "10.0.0.1", "L1 Optical Switch", "Polatis");
        let batch = BatchResult::new(vec![CommandResult::success(
            "r",
            "GetResourceDescription",
            ResponsePayload::Resource(info),
        )]);
        let xml = encode_batch(&batch);
        let doc = roxmltree::Document::parse(xml.trim_end()).expect("well formed");
        let ri = doc
            .descendants()
            .find(|n| n.tag_name().name() == "ResourceInfo")
            .expect("resource info");
        assert_eq!(ri.attribute("Address"), Some("10.0.0.1"));
        assert_eq!(ri.parent_element().map(|p| p.tag_name().name()), Some("ResponseInfo"));
    }
}
