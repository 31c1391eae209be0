// Verify the wire format matches what session clients expect.
// Inbound: JSON {command, args}; bare text falls back to chat.
// Outbound: raw text, or one-key JSON envelopes.

use aegis_protocol::frames::{InboundRequest, OutboundFrame};

#[test]
fn inbound_command_with_args() {
    let req = InboundRequest::parse(r#"{"command":"vm_execute","args":{"command":"ls","timeout":5}}"#);
    assert_eq!(req.command, "vm_execute");
    assert_eq!(req.str_arg("command").unwrap(), "ls");
    assert_eq!(req.opt_u64_arg("timeout"), Some(5));
}

#[test]
fn inbound_missing_args_defaults_to_null() {
    let req = InboundRequest::parse(r#"{"command":"list_sessions"}"#);
    assert_eq!(req.command, "list_sessions");
    assert!(req.str_arg("prompt").is_err());
}

#[test]
fn bare_text_becomes_chat_prompt() {
    let req = InboundRequest::parse("what is the weather");
    assert_eq!(req.command, "chat");
    assert_eq!(req.str_arg("prompt").unwrap(), "what is the weather");
}

#[test]
fn text_frame_renders_verbatim() {
    let frame = OutboundFrame::Text("hello {not json}".into());
    assert_eq!(frame.render(), "hello {not json}");
}

#[test]
fn result_frame_serialization() {
    let frame = OutboundFrame::ok(serde_json::json!("/data/report.pdf"));
    let rendered = frame.render();
    assert_eq!(rendered, r#"{"result":"/data/report.pdf"}"#);
}

#[test]
fn error_frame_serialization() {
    let frame = OutboundFrame::error("Unknown command: frobnicate");
    let parsed: serde_json::Value = serde_json::from_str(&frame.render()).unwrap();
    assert_eq!(parsed["error"], "Unknown command: frobnicate");
    assert!(parsed.get("result").is_none());
}

#[test]
fn stdin_request_frame_serialization() {
    let frame = OutboundFrame::StdinRequest("Continue? [y/n]".into());
    let parsed: serde_json::Value = serde_json::from_str(&frame.render()).unwrap();
    assert_eq!(parsed["stdin_request"], "Continue? [y/n]");
}

#[test]
fn returned_file_frame_base64_payload() {
    let frame = OutboundFrame::ReturnedFile {
        name: "out.bin".into(),
        data: vec![0x00, 0x01, 0xff],
    };
    let parsed: serde_json::Value = serde_json::from_str(&frame.render()).unwrap();
    assert_eq!(parsed["returned_file"], "out.bin");
    assert_eq!(parsed["data"], "AAH/");
}
