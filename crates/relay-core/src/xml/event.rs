//! Event envelope codec: `<event id="" channel="" resource=""><via>..</via>
//! ...arbitrary payload...</event>`.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Reader;
use quick_xml::Writer;
use thiserror::Error;

use crate::event::DispatchEvent;
use crate::uri::Uri;

/// Errors specific to event-envelope parsing/rendering.
#[derive(Debug, Error)]
pub enum EventDocError {
    #[error("xml syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("xml attribute error: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("<event> is missing required attribute `{0}`")]
    MissingAttribute(&'static str),
    #[error("root element must be <event>, found `{0}`")]
    WrongRoot(String),
    #[error("unexpected end of document inside <{0}>")]
    UnexpectedEof(&'static str),
    #[error("invalid channel or resource uri: {0}")]
    InvalidUri(#[from] crate::error::Error),
}

/// Parses an event envelope into a [`DispatchEvent`]. `id` is generated if
/// the document omits the attribute.
pub fn parse_event(xml: &[u8]) -> Result<DispatchEvent, EventDocError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut id: Option<String> = None;
    let mut channel: Option<String> = None;
    let mut resource: Option<String> = None;
    let mut via = Vec::new();
    let mut content_start = None;
    let mut content_end = None;
    let mut excludes: Vec<(usize, usize)> = Vec::new();

    loop {
        let pos_before = reader.buffer_position();
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => return Err(EventDocError::UnexpectedEof("event")),
            Event::Start(ref e) if content_start.is_none() => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name != "event" {
                    return Err(EventDocError::WrongRoot(name));
                }
                for attr in e.attributes() {
                    let attr = attr?;
                    let value = attr
                        .decode_and_unescape_value(reader.decoder())?
                        .into_owned();
                    match attr.key.as_ref() {
                        b"id" => id = Some(value),
                        b"channel" => channel = Some(value),
                        b"resource" => resource = Some(value),
                        _ => {}
                    }
                }
                content_start = Some(reader.buffer_position());
            }
            Event::Start(ref e) if e.name().as_ref() == b"via" => {
                let mut text = String::new();
                loop {
                    match reader.read_event_into(&mut buf)? {
                        Event::Text(t) => text.push_str(&t.unescape()?),
                        Event::End(ee) if ee.name().as_ref() == b"via" => break,
                        Event::Eof => return Err(EventDocError::UnexpectedEof("via")),
                        _ => {}
                    }
                }
                excludes.push((pos_before, reader.buffer_position()));
                via.push(text);
            }
            Event::End(ref e) if e.name().as_ref() == b"event" => {
                content_end = Some(pos_before);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    let content_start = content_start.ok_or(EventDocError::MissingAttribute("id"))?;
    let content_end = content_end.ok_or(EventDocError::UnexpectedEof("event"))?;
    let channel = channel.ok_or(EventDocError::MissingAttribute("channel"))?;

    let mut body = Vec::new();
    let mut cursor = content_start;
    for (start, end) in excludes {
        if start > cursor {
            body.extend_from_slice(&xml[cursor..start]);
        }
        cursor = cursor.max(end);
    }
    if content_end > cursor {
        body.extend_from_slice(&xml[cursor..content_end]);
    }

    let channel: Uri = channel.parse()?;
    let resource: Option<Uri> = resource.map(|r| r.parse()).transpose()?;
    let mut dispatch = DispatchEvent::new(channel, resource, body);
    if let Some(id) = id {
        if let Ok(uuid) = id.parse() {
            dispatch.id = uuid;
        }
    }
    dispatch.via = via;
    Ok(dispatch)
}

/// Renders a [`DispatchEvent`] back into an event envelope document.
pub fn render_event(event: &DispatchEvent) -> Result<Vec<u8>, EventDocError> {
    let mut writer = Writer::new(Vec::new());

    let mut start = BytesStart::new("event");
    start.push_attribute(("id", event.id.to_string().as_str()));
    start.push_attribute(("channel", event.channel.to_string().as_str()));
    if let Some(resource) = &event.resource {
        start.push_attribute(("resource", resource.to_string().as_str()));
    }
    writer.write_event(Event::Start(start))?;

    for hop in &event.via {
        writer.write_event(Event::Start(BytesStart::new("via")))?;
        writer.write_event(Event::Text(BytesText::new(hop)))?;
        writer.write_event(Event::End(BytesEnd::new("via")))?;
    }

    writer.get_mut().extend_from_slice(&event.body);
    writer.write_event(Event::End(BytesEnd::new("event")))?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attributes_and_via_and_preserves_payload() {
        let xml = br#"<event id="11111111-1111-1111-1111-111111111111" channel="http://evt/a" resource="http://evt/r"><via>relay-a</via><payload><x>1</x></payload></event>"#;
        let parsed = parse_event(xml).unwrap();
        assert_eq!(parsed.channel.to_string(), "http://evt/a");
        assert_eq!(parsed.resource.unwrap().to_string(), "http://evt/r");
        assert_eq!(parsed.via, vec!["relay-a".to_string()]);
        assert_eq!(
            String::from_utf8(parsed.body).unwrap(),
            "<payload><x>1</x></payload>"
        );
    }

    #[test]
    fn generates_id_when_absent() {
        let xml = br#"<event channel="http://evt/a"><p/></event>"#;
        let parsed = parse_event(xml).unwrap();
        assert_ne!(parsed.id.to_string(), "");
    }

    #[test]
    fn render_round_trips_channel_and_via() {
        let mut event = DispatchEvent::new("http://evt/a".parse().unwrap(), None, b"<p/>".to_vec());
        event.via.push("relay-a".into());
        let xml = render_event(&event).unwrap();
        let reparsed = parse_event(&xml).unwrap();
        assert_eq!(reparsed.channel, event.channel);
        assert_eq!(reparsed.via, event.via);
        assert_eq!(reparsed.body, event.body);
    }

    #[test]
    fn missing_channel_is_bad_request() {
        let xml = br#"<event id="x"></event>"#;
        assert!(parse_event(xml).is_err());
    }
}
