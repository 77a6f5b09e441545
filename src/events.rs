//! Component I: the event poster (spec §4.I).

use std::str::FromStr;

use purcmc_types::{DataType, ElementKind, ElementSelector, EventMessage, HandleId, Payload, Target};

/// Builds a `destroy` event for a page whose backing web view has closed
/// (spec §4.G "destruction cascade").
pub fn destroy_event(target: Target, container: HandleId) -> EventMessage {
    EventMessage {
        event_name: "destroy".to_string(),
        source_uri: String::new(),
        target,
        target_value: container,
        element: ElementSelector::void(),
        property: None,
        data_type: DataType::Void,
        payload: Payload::Void,
    }
}

/// `suppressPage`/`reloadPage`, emitted when page-owner suppression or
/// reload crosses sessions (spec §4.G).
pub fn page_owner_event(name: &'static str, container: HandleId) -> EventMessage {
    EventMessage {
        event_name: name.to_string(),
        source_uri: String::new(),
        target: Target::PlainWindow,
        target_value: container,
        element: ElementSelector::void(),
        property: None,
        data_type: DataType::Void,
        payload: Payload::Void,
    }
}

pub fn page_activated_event(container: HandleId, activated: bool) -> EventMessage {
    EventMessage {
        event_name: if activated { "pageActivated" } else { "pageDeactivated" }.to_string(),
        source_uri: String::new(),
        target: Target::PlainWindow,
        target_value: container,
        element: ElementSelector::void(),
        property: None,
        data_type: DataType::Void,
        payload: Payload::Void,
    }
}

/// Promotes a subprocess-originated DOM event to a protocol event (spec
/// §4.H last paragraph, §4.I "DOM-originated events proxied from §4.H").
pub fn dom_event(source_uri: String, view: HandleId, event: &crate::dom::SubprocessEvent) -> EventMessage {
    EventMessage {
        event_name: event.name.clone(),
        source_uri,
        target: Target::Dom,
        target_value: view,
        element: ElementSelector {
            kind: ElementKind::from_str(&event.kind).unwrap_or(ElementKind::Void),
            value: event.value.clone(),
        },
        property: None,
        data_type: DataType::Json,
        payload: Payload::Json(event.data.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_event_targets_the_container() {
        let ev = destroy_event(Target::PlainWindow, HandleId(5));
        assert_eq!(ev.event_name, "destroy");
        assert_eq!(ev.target_value, HandleId(5));
    }
}
