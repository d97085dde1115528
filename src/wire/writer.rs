//! Streaming response writer
//!
//! Assembles protocol-correct responses incrementally: the pre-payload
//! frame (error code, service, action, transaction token, opening payload
//! marker) is written before the payload sink is handed out, and the
//! post-payload frame (response parameters, duration, orchestration-fault
//! marker) is written by `done()`. Merge modes suppress either frame so one
//! logical response can be assembled from several partial writes.

use std::io::Write;

use crate::core::error::{code, ServiceError, ServiceResult};

use super::{
    codec::{self, xml_escape},
    message::{field, XML_ROOT},
    Encoding, ParamMap,
};

/// Output sink type threaded through dispatch and orchestration.
pub type DynSink<'a> = &'a mut (dyn Write + Send);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    NotStarted,
    InFlight,
    Done,
}

/// Controls which frames a writer emits.
///
/// A merge window fragment suppresses the pre-frame when it is not the
/// first fragment and the post-frame when it is not the last, so that
/// concatenating all fragments yields one syntactically valid document.
#[derive(Debug, Clone, Copy)]
pub struct MergeMode {
    pub write_open: bool,
    pub write_close: bool,
}

impl Default for MergeMode {
    fn default() -> Self {
        Self::full()
    }
}

impl MergeMode {
    /// Both frames written; a standalone response.
    pub fn full() -> Self {
        Self {
            write_open: true,
            write_close: true,
        }
    }

    /// Frame emission for fragment `index` of `total`.
    pub fn window(index: usize, total: usize) -> Self {
        Self {
            write_open: index == 0,
            write_close: index + 1 >= total,
        }
    }
}

pub struct ResponseWriter<W: Write> {
    out: W,
    encoding: Encoding,
    service: String,
    action: Option<String>,
    transaction: Option<String>,
    merge: MergeMode,
    /// Raw mode streams payload bytes with no envelope at all.
    raw: bool,
    /// Batch mode opens an array marker inside `data` for orchestrated
    /// sub-responses.
    batch: bool,
    state: WriterState,
    payload_bytes: u64,
    parameters: ParamMap,
    duration: Option<u64>,
    fault: Option<bool>,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(out: W, encoding: Encoding, service: impl Into<String>) -> Self {
        Self {
            out,
            encoding,
            service: service.into(),
            action: None,
            transaction: None,
            merge: MergeMode::full(),
            raw: false,
            batch: false,
            state: WriterState::NotStarted,
            payload_bytes: 0,
            parameters: ParamMap::new(),
            duration: None,
            fault: None,
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = Some(transaction.into());
        self
    }

    pub fn merge(mut self, merge: MergeMode) -> Self {
        self.merge = merge;
        self
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Response-only parameters, emitted in the post-frame.
    pub fn set_parameters(&mut self, parameters: ParamMap) {
        self.parameters = parameters;
    }

    /// Elapsed-time field, emitted only when the caller requested it.
    pub fn set_duration(&mut self, millis: u64) {
        self.duration = Some(millis);
    }

    /// Orchestration-fault marker for orchestrated responses.
    pub fn set_fault(&mut self, fault: bool) {
        self.fault = Some(fault);
    }

    /// Write a complete successful response in one shot.
    pub fn write_response(&mut self, payload: &[u8]) -> ServiceResult<()> {
        self.expect_state(WriterState::NotStarted, "write_response")?;
        self.write_pre_frame()?;
        self.out.write_all(payload)?;
        self.payload_bytes += payload.len() as u64;
        self.finish()
    }

    /// Write a complete error response in one shot. Error responses carry
    /// `error-message`, omit `data`, and are never merge-suppressed; batch
    /// fragments that fail are framed through their own child writers.
    pub fn write_error_response(&mut self, error_code: u32, message: &str) -> ServiceResult<()> {
        self.expect_state(WriterState::NotStarted, "write_error_response")?;
        let mut frame = String::new();
        match self.encoding {
            Encoding::Json => {
                frame.push_str(&format!("{{\"{}\":{}", field::ERROR_CODE, error_code));
                frame.push_str(&format!(
                    ",\"{}\":{}",
                    field::ERROR_MESSAGE,
                    json_string(message)
                ));
                frame.push_str(&format!(
                    ",\"{}\":{}",
                    field::SERVICE,
                    json_string(&self.service)
                ));
                if let Some(action) = &self.action {
                    frame.push_str(&format!(",\"{}\":{}", field::ACTION, json_string(action)));
                }
                if let Some(transaction) = &self.transaction {
                    frame.push_str(&format!(
                        ",\"{}\":{}",
                        field::TRANSACTION,
                        json_string(transaction)
                    ));
                }
                self.push_json_post_fields(&mut frame);
                frame.push('}');
            }
            Encoding::Xml => {
                frame.push_str(&format!("<{XML_ROOT}>"));
                push_xml_field(&mut frame, field::ERROR_CODE, &error_code.to_string());
                push_xml_field(&mut frame, field::ERROR_MESSAGE, message);
                push_xml_field(&mut frame, field::SERVICE, &self.service);
                if let Some(action) = &self.action {
                    push_xml_field(&mut frame, field::ACTION, action);
                }
                if let Some(transaction) = &self.transaction {
                    push_xml_field(&mut frame, field::TRANSACTION, transaction);
                }
                self.push_xml_post_fields(&mut frame);
                frame.push_str(&format!("</{XML_ROOT}>"));
            }
        }
        self.out.write_all(frame.as_bytes())?;
        self.out.flush()?;
        self.state = WriterState::Done;
        Ok(())
    }

    /// Write the pre-frame and hand out the payload sink.
    pub fn stream(&mut self) -> ServiceResult<PayloadSink<'_, W>> {
        self.expect_state(WriterState::NotStarted, "stream")?;
        self.write_pre_frame()?;
        self.state = WriterState::InFlight;
        Ok(PayloadSink { writer: self })
    }

    /// Convenience for callers that already hold the payload in memory.
    pub fn write_payload(&mut self, bytes: &[u8]) -> ServiceResult<()> {
        self.expect_state(WriterState::InFlight, "write_payload")?;
        self.out.write_all(bytes)?;
        self.payload_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Close the response. From `NotStarted` this synthesizes a well-formed
    /// empty success response; from `InFlight` it writes the post-frame.
    pub fn done(&mut self) -> ServiceResult<()> {
        match self.state {
            WriterState::Done => Err(ServiceError::IllegalState(
                "done called on a finished response writer".to_string(),
            )),
            WriterState::NotStarted => {
                self.write_pre_frame()?;
                self.finish()
            }
            WriterState::InFlight => self.finish(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn expect_state(&self, expected: WriterState, operation: &str) -> ServiceResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ServiceError::IllegalState(format!(
                "{operation} requires state {expected:?}, writer is {:?}",
                self.state
            )))
        }
    }

    fn write_pre_frame(&mut self) -> ServiceResult<()> {
        if self.raw || !self.merge.write_open {
            return Ok(());
        }
        let mut frame = String::new();
        match self.encoding {
            Encoding::Json => {
                frame.push_str(&format!("{{\"{}\":{}", field::ERROR_CODE, code::OK));
                frame.push_str(&format!(
                    ",\"{}\":{}",
                    field::SERVICE,
                    json_string(&self.service)
                ));
                if let Some(action) = &self.action {
                    frame.push_str(&format!(",\"{}\":{}", field::ACTION, json_string(action)));
                }
                if let Some(transaction) = &self.transaction {
                    frame.push_str(&format!(
                        ",\"{}\":{}",
                        field::TRANSACTION,
                        json_string(transaction)
                    ));
                }
                frame.push_str(&format!(",\"{}\":", field::DATA));
                if self.batch {
                    frame.push('[');
                }
            }
            Encoding::Xml => {
                frame.push_str(&format!("<{XML_ROOT}>"));
                push_xml_field(&mut frame, field::ERROR_CODE, &code::OK.to_string());
                push_xml_field(&mut frame, field::SERVICE, &self.service);
                if let Some(action) = &self.action {
                    push_xml_field(&mut frame, field::ACTION, action);
                }
                if let Some(transaction) = &self.transaction {
                    push_xml_field(&mut frame, field::TRANSACTION, transaction);
                }
                frame.push_str(&format!("<{}>", field::DATA));
            }
        }
        self.out.write_all(frame.as_bytes())?;
        Ok(())
    }

    fn finish(&mut self) -> ServiceResult<()> {
        if !self.raw
            && !self.batch
            && self.merge.write_open
            && self.merge.write_close
            && self.payload_bytes == 0
            && self.encoding == Encoding::Json
        {
            // Keep the document valid when nothing was streamed into data.
            self.out.write_all(b"null")?;
        }
        if !self.raw && self.merge.write_close {
            let mut frame = String::new();
            match self.encoding {
                Encoding::Json => {
                    if self.batch {
                        frame.push(']');
                    }
                    self.push_json_post_fields(&mut frame);
                    frame.push('}');
                }
                Encoding::Xml => {
                    frame.push_str(&format!("</{}>", field::DATA));
                    self.push_xml_post_fields(&mut frame);
                    frame.push_str(&format!("</{XML_ROOT}>"));
                }
            }
            self.out.write_all(frame.as_bytes())?;
        }
        self.out.flush()?;
        self.state = WriterState::Done;
        Ok(())
    }

    fn push_json_post_fields(&self, frame: &mut String) {
        if !self.parameters.is_empty() {
            let value = codec::structured_from_parameter_map(&self.parameters);
            if let Ok(text) = serde_json::to_string(&value) {
                frame.push_str(&format!(",\"{}\":{}", field::PARAMETERS, text));
            }
        }
        if let Some(duration) = self.duration {
            frame.push_str(&format!(",\"{}\":{}", field::DURATION, duration));
        }
        if let Some(fault) = self.fault {
            frame.push_str(&format!(",\"{}\":{}", field::ORCHESTRATION_FAULT, fault));
        }
    }

    fn push_xml_post_fields(&self, frame: &mut String) {
        if !self.parameters.is_empty() {
            frame.push_str(&format!("<{}>", field::PARAMETERS));
            let value = codec::structured_from_parameter_map(&self.parameters);
            if let serde_json::Value::Object(map) = value {
                codec::write_xml_object(frame, &map);
            }
            frame.push_str(&format!("</{}>", field::PARAMETERS));
        }
        if let Some(duration) = self.duration {
            push_xml_field(frame, field::DURATION, &duration.to_string());
        }
        if let Some(fault) = self.fault {
            push_xml_field(frame, field::ORCHESTRATION_FAULT, &fault.to_string());
        }
    }
}

/// Payload sink handed out by [`ResponseWriter::stream`]. Bytes written
/// here land between the pre- and post-frames.
pub struct PayloadSink<'a, W: Write> {
    writer: &'a mut ResponseWriter<W>,
}

impl<W: Write> Write for PayloadSink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.out.write(buf)?;
        self.writer.payload_bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.out.flush()
    }
}

fn json_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

fn push_xml_field(frame: &mut String, tag: &str, text: &str) {
    frame.push_str(&format!("<{tag}>{}</{tag}>", xml_escape(text)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireMessage;

    fn writer(buf: &mut Vec<u8>, encoding: Encoding) -> ResponseWriter<&mut Vec<u8>> {
        ResponseWriter::new(buf, encoding, "svc")
    }

    #[test]
    fn single_shot_response_json() {
        let mut buf = Vec::new();
        let mut w = writer(&mut buf, Encoding::Json)
            .action("do")
            .transaction("t1");
        w.write_response(b"{\"k\":\"v\"}").unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\"error-code\":0,\"service\":\"svc\",\"action\":\"do\",\
             \"transaction-data\":\"t1\",\"data\":{\"k\":\"v\"}}"
        );
    }

    #[test]
    fn streamed_equals_single_shot() {
        let payload = b"{\"k\":\"v\"}";
        let mut single = Vec::new();
        writer(&mut single, Encoding::Json)
            .write_response(payload)
            .unwrap();

        let mut streamed = Vec::new();
        let mut w = writer(&mut streamed, Encoding::Json);
        {
            let mut sink = w.stream().unwrap();
            sink.write_all(payload).unwrap();
        }
        w.done().unwrap();
        assert_eq!(single, streamed);
    }

    #[test]
    fn done_from_not_started_synthesizes_empty_success() {
        let mut buf = Vec::new();
        writer(&mut buf, Encoding::Json).done().unwrap();
        let (_, msg) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert!(!msg.is_error());
        assert!(msg.payload.is_none());

        let mut buf = Vec::new();
        writer(&mut buf, Encoding::Xml).done().unwrap();
        let (_, msg) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert!(!msg.is_error());
    }

    #[test]
    fn post_frame_carries_parameters_duration_and_fault() {
        let mut buf = Vec::new();
        let mut w = writer(&mut buf, Encoding::Json);
        let mut params = ParamMap::new();
        params.insert("warn".to_string(), vec!["slow".to_string()]);
        w.set_parameters(params);
        w.set_duration(12);
        w.set_fault(true);
        w.write_response(b"1").unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with(
            ",\"parameters\":{\"warn\":\"slow\"},\"duration\":12,\"orchestration-fault\":true}"
        ));
    }

    #[test]
    fn error_response_shape() {
        for encoding in [Encoding::Json, Encoding::Xml] {
            let mut buf = Vec::new();
            let mut w = writer(&mut buf, encoding);
            w.write_error_response(code::NOT_FOUND, "missing 'x'").unwrap();
            let (sniffed, msg) =
                WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
            assert_eq!(sniffed, encoding);
            assert_eq!(msg.error_code, code::NOT_FOUND);
            assert_eq!(msg.error_message.as_deref(), Some("missing 'x'"));
            assert!(msg.payload.is_none());
        }
    }

    #[test]
    fn state_violations_are_illegal_state_errors() {
        let mut buf = Vec::new();
        let mut w = writer(&mut buf, Encoding::Json);
        w.write_response(b"1").unwrap();
        assert!(matches!(
            w.write_response(b"2"),
            Err(ServiceError::IllegalState(_))
        ));
        assert!(matches!(w.stream().err(), Some(ServiceError::IllegalState(_))));
        assert!(matches!(w.done(), Err(ServiceError::IllegalState(_))));
    }

    #[test]
    fn raw_mode_skips_all_framing() {
        let mut buf = Vec::new();
        let mut w = writer(&mut buf, Encoding::Json).raw(true);
        w.write_response(b"raw bytes").unwrap();
        assert_eq!(buf, b"raw bytes");
    }

    #[test]
    fn merge_window_fragments_concatenate() {
        // One batch written whole...
        let mut whole = Vec::new();
        let mut w = writer(&mut whole, Encoding::Json).batch(true);
        {
            let mut sink = w.stream().unwrap();
            sink.write_all(b"{\"error-code\":0,\"service\":\"a\",\"data\":1},").unwrap();
            sink.write_all(b"{\"error-code\":0,\"service\":\"b\",\"data\":2}").unwrap();
        }
        w.set_fault(false);
        w.done().unwrap();

        // ...and the same batch as three window fragments.
        let mut pieces = Vec::new();
        for (index, chunk) in [
            &b"{\"error-code\":0,\"service\":\"a\",\"data\":1}"[..],
            b",",
            b"{\"error-code\":0,\"service\":\"b\",\"data\":2}",
        ]
        .iter()
        .enumerate()
        {
            let mut buf = Vec::new();
            let mut w = writer(&mut buf, Encoding::Json)
                .batch(true)
                .merge(MergeMode::window(index, 3));
            {
                let mut sink = w.stream().unwrap();
                sink.write_all(chunk).unwrap();
            }
            if index + 1 >= 3 {
                w.set_fault(false);
            }
            w.done().unwrap();
            pieces.extend_from_slice(&buf);
        }
        assert_eq!(whole, pieces);
    }
}
