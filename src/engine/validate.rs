use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Reject inverted, empty, out-of-range and overlong windows.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if !span.is_valid() {
        return Err(EngineError::InvalidWindow(*span));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("event too long"));
    }
    Ok(())
}

pub(crate) fn validate_required(
    value: &str,
    field: &'static str,
    max_len: usize,
    too_long: &'static str,
) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::EmptyField(field));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(())
}

pub(crate) fn validate_event(event: &Event) -> Result<(), EngineError> {
    validate_required(&event.title, "title", MAX_TITLE_LEN, "title too long")?;
    if let Some(ref d) = event.description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    validate_span(&event.span)
}

pub(crate) fn validate_resource(resource: &Resource) -> Result<(), EngineError> {
    validate_required(&resource.name, "name", MAX_NAME_LEN, "resource name too long")?;
    validate_required(&resource.kind, "kind", MAX_KIND_LEN, "resource kind too long")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn event(title: &str, start: Ms, end: Ms) -> Event {
        Event {
            id: Ulid::new(),
            title: title.into(),
            span: Span::unchecked(start, end),
            description: None,
        }
    }

    #[test]
    fn inverted_and_empty_windows_rejected() {
        assert!(matches!(
            validate_event(&event("x", 200, 100)),
            Err(EngineError::InvalidWindow(_))
        ));
        assert!(matches!(
            validate_event(&event("x", 100, 100)),
            Err(EngineError::InvalidWindow(_))
        ));
        assert!(validate_event(&event("x", 100, 101)).is_ok());
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(matches!(
            validate_span(&Span::new(-10, 10)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1)),
            Err(EngineError::LimitExceeded("event too long"))
        ));
    }

    #[test]
    fn blank_title_rejected() {
        assert!(matches!(
            validate_event(&event("   ", 0, 10)),
            Err(EngineError::EmptyField("title"))
        ));
        let long = "t".repeat(MAX_TITLE_LEN + 1);
        assert!(matches!(
            validate_event(&event(&long, 0, 10)),
            Err(EngineError::LimitExceeded("title too long"))
        ));
    }

    #[test]
    fn resource_fields_required() {
        let r = Resource {
            id: Ulid::new(),
            name: "Projector".into(),
            kind: String::new(),
        };
        assert!(matches!(
            validate_resource(&r),
            Err(EngineError::EmptyField("kind"))
        ));
    }
}
