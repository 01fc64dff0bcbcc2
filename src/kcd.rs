//! Reading and writing the KCD file format (a documented subset).
//!
//! KCD is an XML format (namespace `http://kayak.2codeornot2code.org/1.0`)
//! describing buses, messages and signals. This module translates between
//! KCD byte streams and [`Configuration`] values. Schema validation is out of
//! scope; unknown elements and attributes are ignored on read, with one
//! exception: multiplexed signals are not supported and fail hard rather than
//! being silently mis-read.
//!
//! The writer emits canonical indentation and attribute order, so that
//! writing a configuration and reading it back yields a structurally equal
//! configuration (`read ∘ write ∘ read = read`).

use std::collections::BTreeSet;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::debug;

use crate::codec::{ByteOrder, ValueType};
use crate::config::Configuration;
use crate::errors::CanError;
use crate::frame::FrameDefinition;
use crate::signal::SignalDefinition;

/// Bus name used by the writer when the configuration has none.
pub const DEFAULT_BUS_NAME: &str = "Mainbus";

const KCD_NAMESPACE: &str = "http://kayak.2codeornot2code.org/1.0";

/// Read a configuration from KCD text.
///
/// `bus_name` selects which `Bus` element to use; `None` picks the
/// alphabetically first one. A document without any bus definition is an
/// error.
pub fn read_str(input: &str, bus_name: Option<&str>) -> Result<Configuration, CanError> {
    let available = list_bus_names(input)?;
    if available.is_empty() {
        return Err(CanError::Kcd("no bus definition found".into()));
    }
    let target = match bus_name {
        Some(name) => name.to_string(),
        // The set is ordered, so first = alphabetically first.
        None => match available.iter().next() {
            Some(name) => name.clone(),
            None => return Err(CanError::Kcd("no bus definition found".into())),
        },
    };
    if !available.contains(&target) {
        return Err(CanError::Kcd(format!(
            "no bus named '{target}'; available buses: {}",
            available.iter().cloned().collect::<Vec<_>>().join(", ")
        )));
    }
    debug!(bus = %target, "parsing KCD bus definition");

    let mut config = Configuration::new();
    config.set_bus_name(target.clone());

    let mut reader = Reader::from_str(input);
    loop {
        match next_event(&mut reader)? {
            Event::Start(start) if start.local_name().as_ref() == b"Bus" => {
                if attr(&start, "name")?.as_deref() == Some(target.as_str()) {
                    read_bus(&mut reader, &mut config)?;
                } else {
                    skip_subtree(&mut reader, &start)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(config)
}

/// Read a configuration from a KCD file.
pub fn read_file(path: impl AsRef<Path>, bus_name: Option<&str>) -> Result<Configuration, CanError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "reading KCD file");
    let text = std::fs::read_to_string(path)?;
    read_str(&text, bus_name)
}

/// Serialize a configuration as canonical KCD text.
pub fn write_string(config: &Configuration) -> Result<String, CanError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(write_err)?;

    let mut root = BytesStart::new("NetworkDefinition");
    root.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
    root.push_attribute(("xmlns", KCD_NAMESPACE));
    root.push_attribute(("xsi:noNamespaceSchemaLocation", "Definition.xsd"));
    writer.write_event(Event::Start(root)).map_err(write_err)?;
    writer
        .write_event(Event::Empty(BytesStart::new("Document")))
        .map_err(write_err)?;

    let mut bus = BytesStart::new("Bus");
    bus.push_attribute(("name", config.bus_name().unwrap_or(DEFAULT_BUS_NAME)));
    writer.write_event(Event::Start(bus)).map_err(write_err)?;

    for frame in config.frames() {
        write_message(&mut writer, frame)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Bus")))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("NetworkDefinition")))
        .map_err(write_err)?;

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    String::from_utf8(bytes).map_err(|err| CanError::Kcd(format!("invalid UTF-8: {err}")))
}

/// Write a configuration to a KCD file.
pub fn write_file(config: &Configuration, path: impl AsRef<Path>) -> Result<(), CanError> {
    let text = write_string(config)?;
    std::fs::write(path, text)?;
    Ok(())
}

// Reader internals

fn next_event<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Event<'a>, CanError> {
    reader
        .read_event()
        .map_err(|err| CanError::Kcd(format!("malformed XML: {err}")))
}

fn skip_subtree(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<(), CanError> {
    reader
        .read_to_end(start.name())
        .map_err(|err| CanError::Kcd(format!("malformed XML: {err}")))?;
    Ok(())
}

fn attr(element: &BytesStart, name: &str) -> Result<Option<String>, CanError> {
    for attribute in element.attributes() {
        let attribute =
            attribute.map_err(|err| CanError::Kcd(format!("malformed attribute: {err}")))?;
        if attribute.key.local_name().as_ref() == name.as_bytes() {
            let value = attribute
                .unescape_value()
                .map_err(|err| CanError::Kcd(format!("malformed attribute value: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn check_no_multiplex_attr(element: &BytesStart, context: &str) -> Result<(), CanError> {
    if attr(element, "multiplex")?.is_some() {
        return Err(CanError::Kcd(format!(
            "{context}: multiplexed signals are not supported"
        )));
    }
    Ok(())
}

/// Collect the names of all `Bus` elements in the document.
fn list_bus_names(input: &str) -> Result<BTreeSet<String>, CanError> {
    let mut reader = Reader::from_str(input);
    let mut names = BTreeSet::new();
    loop {
        match next_event(&mut reader)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Bus" => {
                if let Some(name) = attr(&e, "name")? {
                    names.insert(name);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(names)
}

fn read_bus(reader: &mut Reader<&[u8]>, config: &mut Configuration) -> Result<(), CanError> {
    loop {
        match next_event(reader)? {
            Event::Start(start) => match start.local_name().as_ref() {
                b"Message" => {
                    let frame = read_message(reader, &start, false)?;
                    config.add_frame(frame)?;
                }
                _ => skip_subtree(reader, &start)?,
            },
            Event::Empty(start) if start.local_name().as_ref() == b"Message" => {
                let frame = read_message(reader, &start, true)?;
                config.add_frame(frame)?;
            }
            Event::End(end) if end.local_name().as_ref() == b"Bus" => return Ok(()),
            Event::Eof => return Err(CanError::Kcd("unexpected end of document in Bus".into())),
            _ => {}
        }
    }
}

fn read_message(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    is_empty: bool,
) -> Result<FrameDefinition, CanError> {
    check_no_multiplex_attr(start, "Message")?;

    let name = attr(start, "name")?.unwrap_or_default();
    let id_text = attr(start, "id")?
        .ok_or_else(|| CanError::Kcd(format!("Message '{name}' is missing the id attribute")))?;
    let raw_id = parse_hex_id(&id_text)
        .ok_or_else(|| CanError::Kcd(format!("Message '{name}' has invalid id '{id_text}'")))?;
    let dlc = match attr(start, "length")? {
        Some(text) => text
            .parse::<u8>()
            .map_err(|_| CanError::Kcd(format!("Message '{name}' has invalid length '{text}'")))?,
        None => 8,
    };
    let format = attr(start, "format")?;
    let mut frame = match format.as_deref() {
        None | Some("standard") => FrameDefinition::standard(
            raw_id.try_into().map_err(|_| {
                CanError::Kcd(format!("Message '{name}' id {raw_id:#x} above 0x7FF"))
            })?,
            name.clone(),
            dlc,
        )?,
        Some("extended") => FrameDefinition::extended(raw_id, name.clone(), dlc)?,
        Some(other) => {
            return Err(CanError::Kcd(format!(
                "Message '{name}' has unknown format '{other}'"
            )));
        }
    };
    if let Some(text) = attr(start, "interval")? {
        let interval = text
            .parse::<f64>()
            .map_err(|_| CanError::Kcd(format!("Message '{name}' has invalid interval '{text}'")))?;
        if !interval.is_finite() || interval < 0.0 {
            return Err(CanError::Kcd(format!(
                "Message '{name}' has invalid interval '{text}'"
            )));
        }
        if interval > 0.0 {
            frame.set_cycle_time_ms(Some(interval as u32))?;
        }
    }
    debug!(message = %name, id = raw_id, "parsed KCD message");

    if is_empty {
        return Ok(frame);
    }

    loop {
        match next_event(reader)? {
            Event::Start(start) => match start.local_name().as_ref() {
                b"Signal" => frame.add_signal(read_signal(reader, &start, false)?)?,
                b"Producer" => read_producer(reader, &mut frame)?,
                b"Multiplex" => {
                    return Err(CanError::Kcd(format!(
                        "Message '{name}': multiplexed signals are not supported"
                    )));
                }
                _ => skip_subtree(reader, &start)?,
            },
            Event::Empty(start) => match start.local_name().as_ref() {
                b"Signal" => frame.add_signal(read_signal(reader, &start, true)?)?,
                b"Multiplex" => {
                    return Err(CanError::Kcd(format!(
                        "Message '{name}': multiplexed signals are not supported"
                    )));
                }
                _ => {}
            },
            Event::End(end) if end.local_name().as_ref() == b"Message" => return Ok(frame),
            Event::Eof => {
                return Err(CanError::Kcd("unexpected end of document in Message".into()));
            }
            _ => {}
        }
    }
}

fn read_producer(reader: &mut Reader<&[u8]>, frame: &mut FrameDefinition) -> Result<(), CanError> {
    loop {
        match next_event(reader)? {
            Event::Start(start) | Event::Empty(start)
                if start.local_name().as_ref() == b"NodeRef" =>
            {
                if let Some(id) = attr(&start, "id")? {
                    frame.add_producer(id);
                }
            }
            Event::End(end) if end.local_name().as_ref() == b"Producer" => return Ok(()),
            Event::Eof => {
                return Err(CanError::Kcd("unexpected end of document in Producer".into()));
            }
            _ => {}
        }
    }
}

fn read_signal(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    is_empty: bool,
) -> Result<SignalDefinition, CanError> {
    check_no_multiplex_attr(start, "Signal")?;

    let name = attr(start, "name")?
        .ok_or_else(|| CanError::Kcd("Signal is missing the name attribute".into()))?;
    let offset_text = attr(start, "offset")?
        .ok_or_else(|| CanError::Kcd(format!("Signal '{name}' is missing the offset attribute")))?;
    let start_bit = offset_text
        .parse::<u8>()
        .map_err(|_| CanError::Kcd(format!("Signal '{name}' has invalid offset '{offset_text}'")))?;
    let num_bits = match attr(start, "length")? {
        Some(text) => text.parse::<u8>().map_err(|_| {
            CanError::Kcd(format!("Signal '{name}' has invalid length '{text}'"))
        })?,
        None => 1,
    };
    // NOTE: "endianess" is the KCD file format's spelling.
    let byte_order = match attr(start, "endianess")?.as_deref() {
        None | Some("little") => ByteOrder::Little,
        Some("big") => ByteOrder::Big,
        Some(other) => {
            return Err(CanError::Kcd(format!(
                "Signal '{name}' has unknown endianess '{other}'"
            )));
        }
    };

    let mut builder = SignalDefinition::builder(name.clone(), start_bit, num_bits)
        .byte_order(byte_order);

    if !is_empty {
        loop {
            match next_event(reader)? {
                Event::Start(child) => match child.local_name().as_ref() {
                    b"Notes" => {
                        let notes = read_notes(reader)?;
                        builder = builder.description(notes);
                    }
                    b"Value" => {
                        builder = apply_value_attrs(builder, &child, &name)?;
                        skip_subtree(reader, &child)?;
                    }
                    _ => skip_subtree(reader, &child)?,
                },
                Event::Empty(child) => {
                    if child.local_name().as_ref() == b"Value" {
                        builder = apply_value_attrs(builder, &child, &name)?;
                    }
                }
                Event::End(end) if end.local_name().as_ref() == b"Signal" => break,
                Event::Eof => {
                    return Err(CanError::Kcd("unexpected end of document in Signal".into()));
                }
                _ => {}
            }
        }
    }

    builder.build()
}

fn read_notes(reader: &mut Reader<&[u8]>) -> Result<String, CanError> {
    let mut text = String::new();
    loop {
        match next_event(reader)? {
            Event::Text(t) => {
                let chunk = t
                    .unescape()
                    .map_err(|err| CanError::Kcd(format!("malformed Notes text: {err}")))?;
                text.push_str(chunk.trim());
            }
            Event::End(end) if end.local_name().as_ref() == b"Notes" => return Ok(text),
            Event::Eof => return Err(CanError::Kcd("unexpected end of document in Notes".into())),
            _ => {}
        }
    }
}

fn apply_value_attrs(
    mut builder: crate::signal::SignalBuilder,
    value: &BytesStart,
    signal_name: &str,
) -> Result<crate::signal::SignalBuilder, CanError> {
    let parse = |attr_name: &str, text: String| -> Result<f64, CanError> {
        text.parse::<f64>().map_err(|_| {
            CanError::Kcd(format!(
                "Signal '{signal_name}' has invalid {attr_name} '{text}'"
            ))
        })
    };

    match attr(value, "type")?.as_deref() {
        None | Some("unsigned") => {}
        Some("signed") => builder = builder.value_type(ValueType::Signed),
        Some(other) => {
            return Err(CanError::Kcd(format!(
                "Signal '{signal_name}' has unsupported value type '{other}'"
            )));
        }
    }
    if let Some(text) = attr(value, "slope")? {
        builder = builder.scaling_factor(parse("slope", text)?);
    }
    if let Some(text) = attr(value, "intercept")? {
        builder = builder.value_offset(parse("intercept", text)?);
    }
    if let Some(text) = attr(value, "unit")? {
        builder = builder.unit(text);
    }
    if let Some(text) = attr(value, "min")? {
        builder = builder.min_value(parse("min", text)?);
    }
    if let Some(text) = attr(value, "max")? {
        builder = builder.max_value(parse("max", text)?);
    }
    if let Some(text) = attr(value, "defaultValue")? {
        builder = builder.default_value(parse("defaultValue", text)?);
    }
    Ok(builder)
}

fn parse_hex_id(text: &str) -> Option<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16).ok()
}

// Writer internals

fn write_err(err: impl std::fmt::Display) -> CanError {
    CanError::Kcd(format!("XML write failed: {err}"))
}

fn write_message(writer: &mut Writer<Vec<u8>>, frame: &FrameDefinition) -> Result<(), CanError> {
    let mut message = BytesStart::new("Message");
    message.push_attribute(("name", frame.name()));
    message.push_attribute(("id", format!("0x{:03X}", crate::frame::raw_id(frame.id())).as_str()));
    message.push_attribute(("length", frame.dlc().to_string().as_str()));
    if let Some(interval) = frame.cycle_time_ms() {
        message.push_attribute(("interval", interval.to_string().as_str()));
    }
    if frame.is_extended() {
        message.push_attribute(("format", "extended"));
    }

    if frame.signals().is_empty() && frame.producer_node_ids().is_empty() {
        return writer.write_event(Event::Empty(message)).map_err(write_err);
    }
    writer.write_event(Event::Start(message)).map_err(write_err)?;

    for signal in frame.signals() {
        write_signal(writer, signal)?;
    }

    if !frame.producer_node_ids().is_empty() {
        writer.write_event(Event::Start(BytesStart::new("Producer"))).map_err(write_err)?;
        for node_id in frame.producer_node_ids() {
            let mut node_ref = BytesStart::new("NodeRef");
            node_ref.push_attribute(("id", node_id.as_str()));
            writer.write_event(Event::Empty(node_ref)).map_err(write_err)?;
        }
        writer.write_event(Event::End(BytesEnd::new("Producer"))).map_err(write_err)?;
    }

    writer.write_event(Event::End(BytesEnd::new("Message"))).map_err(write_err)
}

fn write_signal(writer: &mut Writer<Vec<u8>>, signal: &SignalDefinition) -> Result<(), CanError> {
    let mut element = BytesStart::new("Signal");
    element.push_attribute(("name", signal.name()));
    element.push_attribute(("offset", signal.start_bit().to_string().as_str()));
    if signal.num_bits() > 1 {
        element.push_attribute(("length", signal.num_bits().to_string().as_str()));
    }
    if signal.byte_order() == ByteOrder::Big {
        element.push_attribute(("endianess", "big"));
    }

    let value_attrs = value_attributes(signal);
    let has_notes = !signal.description().is_empty();
    if value_attrs.is_empty() && !has_notes {
        return writer.write_event(Event::Empty(element)).map_err(write_err);
    }

    writer.write_event(Event::Start(element)).map_err(write_err)?;
    if has_notes {
        writer.write_event(Event::Start(BytesStart::new("Notes"))).map_err(write_err)?;
        writer.write_event(Event::Text(BytesText::new(signal.description()))).map_err(write_err)?;
        writer.write_event(Event::End(BytesEnd::new("Notes"))).map_err(write_err)?;
    }
    if !value_attrs.is_empty() {
        let mut value = BytesStart::new("Value");
        for (key, text) in &value_attrs {
            value.push_attribute((*key, text.as_str()));
        }
        writer.write_event(Event::Empty(value)).map_err(write_err)?;
    }
    writer.write_event(Event::End(BytesEnd::new("Signal"))).map_err(write_err)
}

fn value_attributes(signal: &SignalDefinition) -> Vec<(&'static str, String)> {
    let mut attrs = Vec::new();
    if signal.scaling_factor() != 1.0 {
        attrs.push(("slope", signal.scaling_factor().to_string()));
    }
    if signal.value_offset() != 0.0 {
        attrs.push(("intercept", signal.value_offset().to_string()));
    }
    if signal.value_type() == ValueType::Signed {
        attrs.push(("type", "signed".to_string()));
    }
    if !signal.unit().is_empty() {
        attrs.push(("unit", signal.unit().to_string()));
    }
    if let Some(min) = signal.min_value() {
        attrs.push(("min", min.to_string()));
    }
    if let Some(max) = signal.max_value() {
        attrs.push(("max", max.to_string()));
    }
    if signal.default_value() != signal.value_offset() {
        attrs.push(("defaultValue", signal.default_value().to_string()));
    }
    attrs
}
