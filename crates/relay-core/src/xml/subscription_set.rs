//! Subscription-set document codec.
//!
//! Schema (§6): root `subscription-set` with optional `@version`, one
//! `uri.owner` child, and zero or more `subscription` children; each
//! `subscription` carries an `id` attribute, one or more `channel`
//! children, an optional `uri.resource`/`resource`, one or more
//! `recipient` blocks (each a `uri` plus zero or more `cookie` elements),
//! and an optional `uri.proxy`.
//!
//! The schema allows more than one `channel` per `subscription`, but this
//! crate's matching model (`Subscription::matches`) works against a single
//! channel pattern. A `subscription` with N channels is expanded into N
//! sibling `Subscription` records whose id is `{id}#{n}`; `render_subscription_set`
//! regroups records sharing the same `{id}#` prefix back into one element.

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Reader;
use quick_xml::Writer;
use thiserror::Error;

use crate::subscription::{Cookie, Subscription};
use crate::subscription_set::SubscriptionSet;
use crate::uri::Uri;

/// Errors specific to subscription-set document parsing/rendering.
#[derive(Debug, Error)]
pub enum SubscriptionDocError {
    #[error("xml syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("xml attribute error: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("root element must be <subscription-set>, found `{0}`")]
    WrongRoot(String),
    #[error("<subscription-set> is missing required element `{0}`")]
    MissingElement(&'static str),
    #[error("subscription is missing required attribute `{0}`")]
    MissingAttribute(&'static str),
    #[error("unexpected end of document inside <{0}>")]
    UnexpectedEof(&'static str),
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] crate::error::Error),
}

/// Parses a subscription-set document. `owner`, `access_key`, and
/// `location` on the returned [`SubscriptionSet`] are left at their
/// generated defaults; callers that need to preserve an existing set's
/// identity overwrite those fields themselves after parsing.
pub fn parse_subscription_set(xml: &[u8]) -> Result<SubscriptionSet, SubscriptionDocError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut version: Option<u64> = None;
    let mut owner: Option<Uri> = None;
    let mut subscriptions = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => return Err(SubscriptionDocError::UnexpectedEof("subscription-set")),
            Event::Start(ref e) if owner.is_none() && subscriptions.is_empty() && version.is_none() =>
            {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name != "subscription-set" {
                    return Err(SubscriptionDocError::WrongRoot(name));
                }
                if let Some(v) = find_attr(e, b"version", &reader)? {
                    version = Some(v.parse().unwrap_or(0));
                }
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    buf.clear();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => return Err(SubscriptionDocError::UnexpectedEof("subscription-set")),
            Event::Start(ref e) if e.name().as_ref() == b"uri.owner" => {
                let text = read_text_until_end(&mut reader, &mut buf, b"uri.owner")?;
                owner = Some(text.parse()?);
            }
            Event::Start(ref e) if e.name().as_ref() == b"subscription" => {
                let id = find_attr(e, b"id", &reader)?
                    .ok_or(SubscriptionDocError::MissingAttribute("id"))?;
                subscriptions.extend(parse_subscription_body(&mut reader, &mut buf, id)?);
            }
            Event::End(ref e) if e.name().as_ref() == b"subscription-set" => break,
            _ => {}
        }
        buf.clear();
    }

    let owner = owner.ok_or(SubscriptionDocError::MissingElement("uri.owner"))?;
    let mut set = SubscriptionSet::new(owner);
    set.version = version.unwrap_or(0);
    set.subscriptions = subscriptions;
    Ok(set)
}

fn parse_subscription_body(
    reader: &mut Reader<&[u8]>,
    buf: &mut Vec<u8>,
    id: String,
) -> Result<Vec<Subscription>, SubscriptionDocError> {
    let mut channels = Vec::new();
    let mut resource: Option<Uri> = None;
    let mut recipients = Vec::new();
    let mut cookies = Vec::new();
    let mut proxy: Option<Uri> = None;

    loop {
        match reader.read_event_into(buf)? {
            Event::Eof => return Err(SubscriptionDocError::UnexpectedEof("subscription")),
            Event::Start(ref e) if e.name().as_ref() == b"channel" => {
                let text = read_text_until_end(reader, buf, b"channel")?;
                channels.push(text.parse()?);
            }
            Event::Start(ref e)
                if e.name().as_ref() == b"uri.resource" || e.name().as_ref() == b"resource" =>
            {
                let tag = e.name().as_ref().to_vec();
                let text = read_text_until_end(reader, buf, &tag)?;
                resource = Some(text.parse()?);
            }
            Event::Start(ref e) if e.name().as_ref() == b"uri.proxy" => {
                let text = read_text_until_end(reader, buf, b"uri.proxy")?;
                proxy = Some(text.parse()?);
            }
            Event::Start(ref e) if e.name().as_ref() == b"recipient" => {
                let (uri, recipient_cookies) = parse_recipient(reader, buf)?;
                recipients.push(uri);
                cookies.extend(recipient_cookies);
            }
            Event::End(ref e) if e.name().as_ref() == b"subscription" => break,
            _ => {}
        }
        buf.clear();
    }

    if channels.is_empty() {
        return Err(SubscriptionDocError::MissingElement("channel"));
    }

    if channels.len() == 1 {
        return Ok(vec![Subscription {
            id,
            channel: channels.into_iter().next().expect("len == 1"),
            resource,
            recipients,
            cookies,
            proxy,
        }]);
    }

    Ok(channels
        .into_iter()
        .enumerate()
        .map(|(i, channel)| Subscription {
            id: format!("{id}#{i}"),
            channel,
            resource: resource.clone(),
            recipients: recipients.clone(),
            cookies: cookies.clone(),
            proxy: proxy.clone(),
        })
        .collect())
}

fn parse_recipient(
    reader: &mut Reader<&[u8]>,
    buf: &mut Vec<u8>,
) -> Result<(Uri, Vec<Cookie>), SubscriptionDocError> {
    let mut uri: Option<Uri> = None;
    let mut cookies = Vec::new();
    loop {
        match reader.read_event_into(buf)? {
            Event::Eof => return Err(SubscriptionDocError::UnexpectedEof("recipient")),
            Event::Start(ref e) if e.name().as_ref() == b"uri" => {
                let text = read_text_until_end(reader, buf, b"uri")?;
                uri = Some(text.parse()?);
            }
            Event::Empty(ref e) if e.name().as_ref() == b"cookie" => {
                let name = find_attr(e, b"name", reader)?.unwrap_or_default();
                let value = find_attr(e, b"value", reader)?.unwrap_or_default();
                cookies.push(Cookie { name, value });
            }
            Event::Start(ref e) if e.name().as_ref() == b"cookie" => {
                let name = find_attr(e, b"name", reader)?.unwrap_or_default();
                let value = find_attr(e, b"value", reader)?.unwrap_or_default();
                // consume to matching end; cookie elements carry no text body.
                loop {
                    match reader.read_event_into(buf)? {
                        Event::End(ee) if ee.name().as_ref() == b"cookie" => break,
                        Event::Eof => return Err(SubscriptionDocError::UnexpectedEof("cookie")),
                        _ => {}
                    }
                }
                cookies.push(Cookie { name, value });
            }
            Event::End(ref e) if e.name().as_ref() == b"recipient" => break,
            _ => {}
        }
        buf.clear();
    }
    let uri = uri.ok_or(SubscriptionDocError::MissingElement("uri"))?;
    Ok((uri, cookies))
}

fn read_text_until_end(
    reader: &mut Reader<&[u8]>,
    buf: &mut Vec<u8>,
    tag: &[u8],
) -> Result<String, SubscriptionDocError> {
    let mut text = String::new();
    loop {
        match reader.read_event_into(buf)? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::End(e) if e.name().as_ref() == tag => break,
            Event::Eof => {
                return Err(SubscriptionDocError::UnexpectedEof("element"));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}

fn find_attr(
    start: &BytesStart<'_>,
    key: &[u8],
    reader: &Reader<&[u8]>,
) -> Result<Option<String>, SubscriptionDocError> {
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(
                attr.decode_and_unescape_value(reader.decoder())?.into_owned(),
            ));
        }
    }
    Ok(None)
}

/// Renders a [`SubscriptionSet`] back into a subscription-set document,
/// regrouping `{id}#{n}`-suffixed entries into a single multi-channel
/// `subscription` element.
pub fn render_subscription_set(set: &SubscriptionSet) -> Result<Vec<u8>, SubscriptionDocError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    let mut root = BytesStart::new("subscription-set");
    root.push_attribute(("version", set.version.to_string().as_str()));
    writer.write_event(Event::Start(root))?;

    write_text_element(&mut writer, "uri.owner", &set.owner.to_string())?;

    for group in group_by_base_id(&set.subscriptions) {
        write_subscription_group(&mut writer, group)?;
    }

    writer.write_event(Event::End(BytesEnd::new("subscription-set")))?;
    Ok(writer.into_inner())
}

fn group_by_base_id(subscriptions: &[Subscription]) -> Vec<Vec<&Subscription>> {
    let mut groups: Vec<Vec<&Subscription>> = Vec::new();
    for sub in subscriptions {
        let base = sub.id.split('#').next().unwrap_or(&sub.id);
        if let Some(last) = groups.last_mut() {
            let last_base = last[0].id.split('#').next().unwrap_or(&last[0].id);
            if last_base == base {
                last.push(sub);
                continue;
            }
        }
        groups.push(vec![sub]);
    }
    groups
}

fn write_subscription_group(
    writer: &mut Writer<Vec<u8>>,
    group: Vec<&Subscription>,
) -> Result<(), SubscriptionDocError> {
    let first = group[0];
    let base_id = first.id.split('#').next().unwrap_or(&first.id);

    let mut start = BytesStart::new("subscription");
    start.push_attribute(("id", base_id));
    writer.write_event(Event::Start(start))?;

    for sub in &group {
        write_text_element(writer, "channel", &sub.channel.to_string())?;
    }
    if let Some(resource) = &first.resource {
        write_text_element(writer, "uri.resource", &resource.to_string())?;
    }
    for recipient in &first.recipients {
        writer.write_event(Event::Start(BytesStart::new("recipient")))?;
        write_text_element(writer, "uri", &recipient.to_string())?;
        for cookie in &first.cookies {
            let mut c = BytesStart::new("cookie");
            c.push_attribute(("name", cookie.name.as_str()));
            c.push_attribute(("value", cookie.value.as_str()));
            writer.write_event(Event::Empty(c))?;
        }
        writer.write_event(Event::End(BytesEnd::new("recipient")))?;
    }
    if let Some(proxy) = &first.proxy {
        write_text_element(writer, "uri.proxy", &proxy.to_string())?;
    }

    writer.write_event(Event::End(BytesEnd::new("subscription")))?;
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    tag: &str,
    text: &str,
) -> Result<(), SubscriptionDocError> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(quick_xml::events::BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_set() {
        let xml = br#"<subscription-set version="3">
            <uri.owner>http://client/cb</uri.owner>
            <subscription id="s1">
                <channel>http://evt/a/*</channel>
                <recipient><uri>http://r/sink</uri></recipient>
            </subscription>
        </subscription-set>"#;
        let set = parse_subscription_set(xml).unwrap();
        assert_eq!(set.version, 3);
        assert_eq!(set.owner.to_string(), "http://client/cb");
        assert_eq!(set.subscriptions.len(), 1);
        assert_eq!(set.subscriptions[0].channel.to_string(), "http://evt/a/*");
        assert_eq!(
            set.subscriptions[0].recipients[0].to_string(),
            "http://r/sink"
        );
    }

    #[test]
    fn expands_multi_channel_subscription() {
        let xml = br#"<subscription-set>
            <uri.owner>http://client/cb</uri.owner>
            <subscription id="s1">
                <channel>http://evt/a</channel>
                <channel>http://evt/b</channel>
                <recipient><uri>http://r/sink</uri></recipient>
            </subscription>
        </subscription-set>"#;
        let set = parse_subscription_set(xml).unwrap();
        assert_eq!(set.subscriptions.len(), 2);
        assert_eq!(set.subscriptions[0].id, "s1#0");
        assert_eq!(set.subscriptions[1].id, "s1#1");
    }

    #[test]
    fn render_regroups_expanded_channels() {
        let xml = br#"<subscription-set>
            <uri.owner>http://client/cb</uri.owner>
            <subscription id="s1">
                <channel>http://evt/a</channel>
                <channel>http://evt/b</channel>
                <recipient><uri>http://r/sink</uri></recipient>
            </subscription>
        </subscription-set>"#;
        let mut set = parse_subscription_set(xml).unwrap();
        set.location = "loc1".into();
        let rendered = render_subscription_set(&set).unwrap();
        let reparsed = parse_subscription_set(&rendered).unwrap();
        assert_eq!(reparsed.subscriptions.len(), 2);
        assert_eq!(reparsed.subscriptions[0].id, "s1#0");
    }

    #[test]
    fn parses_cookies() {
        let xml = br#"<subscription-set>
            <uri.owner>http://client/cb</uri.owner>
            <subscription id="s1">
                <channel>http://evt/a</channel>
                <recipient>
                    <uri>http://r/sink</uri>
                    <cookie name="x" value="y"/>
                </recipient>
            </subscription>
        </subscription-set>"#;
        let set = parse_subscription_set(xml).unwrap();
        assert_eq!(set.subscriptions[0].cookies[0].name, "x");
        assert_eq!(set.subscriptions[0].cookies[0].value, "y");
    }
}
