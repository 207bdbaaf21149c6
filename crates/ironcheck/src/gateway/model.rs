//! Executable model of a deployed process, parsed from Zeebe-flavoured BPMN.
//!
//! Only the subset the in-memory broker can execute is accepted: one process
//! per resource, a single start event, service tasks, message catch events,
//! error boundary events, pass-through throw events and end events, joined by
//! at most one outgoing sequence flow per element. Anything else is rejected
//! at deploy time rather than silently misbehaving at run time.

use std::collections::{HashMap, HashSet};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::GatewayError;
use crate::variables::Headers;

const DEFAULT_RETRIES: u32 = 3;

/// Parsed process definition.
#[derive(Debug, Clone)]
pub(crate) struct ProcessModel {
    id: String,
    start: String,
    elements: HashMap<String, Element>,
}

/// A flow node and its (single) successor.
#[derive(Debug, Clone)]
pub(crate) struct Element {
    pub id: String,
    pub kind: ElementKind,
    pub outgoing: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum ElementKind {
    Start,
    End,
    /// Intermediate throw event without an event definition.
    Pass,
    ServiceTask(TaskDefinition),
    MessageCatch(MessageDefinition),
    ErrorBoundary {
        attached_to: String,
        /// `None` catches every error code.
        error_code: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct TaskDefinition {
    pub job_type: String,
    pub retries: u32,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageDefinition {
    pub name: String,
    /// Either a literal or a `=variable.path` expression.
    pub correlation_key: String,
}

impl ProcessModel {
    /// Parse a BPMN resource.
    pub fn parse(content: &[u8]) -> Result<Self, GatewayError> {
        let xml = std::str::from_utf8(content).map_err(malformed)?;
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut parser = Parser::default();
        loop {
            match reader.read_event().map_err(malformed)? {
                Event::Start(e) => parser.open(&e, false)?,
                Event::Empty(e) => parser.open(&e, true)?,
                Event::End(e) => {
                    let name = e.local_name();
                    parser.close(std::str::from_utf8(name.as_ref()).map_err(malformed)?);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        parser.build()
    }

    /// The BPMN process id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The single start event.
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Find the boundary event catching `error_code` on `task_id`.
    ///
    /// A boundary with a matching code wins over a catch-all boundary.
    pub fn error_boundary(&self, task_id: &str, error_code: &str) -> Option<&Element> {
        let mut catch_all = None;
        for element in self.elements.values() {
            let ElementKind::ErrorBoundary {
                attached_to,
                error_code: code,
            } = &element.kind
            else {
                continue;
            };
            if attached_to != task_id {
                continue;
            }
            match code {
                Some(code) if code == error_code => return Some(element),
                Some(_) => {}
                None => catch_all = Some(element),
            }
        }
        catch_all
    }
}

fn malformed(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Deployment(format!("malformed BPMN: {err}"))
}

fn rejected(message: String) -> GatewayError {
    GatewayError::Deployment(message)
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, GatewayError> {
    for attribute in e.attributes() {
        let attribute = attribute.map_err(malformed)?;
        if attribute.key.local_name().as_ref() == name.as_bytes() {
            let value = attribute.unescape_value().map_err(malformed)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_attr(e: &BytesStart<'_>, tag: &str, name: &str) -> Result<String, GatewayError> {
    attr(e, name)?.ok_or_else(|| rejected(format!("<{tag}> is missing the '{name}' attribute")))
}

/// Flow node as seen in the XML, before references are resolved.
#[derive(Debug, Default)]
struct Draft {
    tag: String,
    id: String,
    attached_to: Option<String>,
    job_type: Option<String>,
    retries: Option<String>,
    headers: Headers,
    message_ref: Option<String>,
    error_definition: Option<Option<String>>,
    unsupported_definition: Option<String>,
}

#[derive(Debug, Default)]
struct Parser {
    process_id: Option<String>,
    in_process: bool,
    current: Option<Draft>,
    nodes: Vec<Draft>,
    /// (source, target)
    flows: Vec<(String, String)>,
    /// message id -> (name, correlation key)
    messages: HashMap<String, (String, Option<String>)>,
    current_message: Option<String>,
    /// error id -> error code
    errors: HashMap<String, Option<String>>,
}

impl Parser {
    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<(), GatewayError> {
        let name = e.local_name();
        let tag = std::str::from_utf8(name.as_ref()).map_err(malformed)?;

        match tag {
            "process" => {
                if self.process_id.is_some() {
                    return Err(rejected(
                        "only one process per resource is supported".to_string(),
                    ));
                }
                self.process_id = Some(required_attr(e, tag, "id")?);
                self.in_process = !empty;
            }
            "startEvent" | "endEvent" | "serviceTask" | "intermediateCatchEvent"
            | "intermediateThrowEvent" | "boundaryEvent" => {
                let draft = Draft {
                    tag: tag.to_string(),
                    id: required_attr(e, tag, "id")?,
                    attached_to: attr(e, "attachedToRef")?,
                    ..Default::default()
                };
                if empty {
                    self.nodes.push(draft);
                } else {
                    self.current = Some(draft);
                }
            }
            "taskDefinition" => {
                if let Some(draft) = self.current.as_mut() {
                    draft.job_type = attr(e, "type")?;
                    draft.retries = attr(e, "retries")?;
                }
            }
            "header" => {
                if let Some(draft) = self.current.as_mut() {
                    let key = required_attr(e, tag, "key")?;
                    let value = attr(e, "value")?.unwrap_or_default();
                    draft.headers.insert(key, value);
                }
            }
            "messageEventDefinition" => {
                if let Some(draft) = self.current.as_mut() {
                    draft.message_ref = attr(e, "messageRef")?;
                }
            }
            "errorEventDefinition" => {
                if let Some(draft) = self.current.as_mut() {
                    draft.error_definition = Some(attr(e, "errorRef")?);
                }
            }
            "timerEventDefinition" | "signalEventDefinition" | "escalationEventDefinition"
            | "compensateEventDefinition" | "conditionalEventDefinition"
            | "linkEventDefinition" => {
                if let Some(draft) = self.current.as_mut() {
                    draft.unsupported_definition = Some(tag.to_string());
                }
            }
            "message" => {
                let id = required_attr(e, tag, "id")?;
                let message_name = required_attr(e, tag, "name")?;
                self.messages.insert(id.clone(), (message_name, None));
                if !empty {
                    self.current_message = Some(id);
                }
            }
            "subscription" => {
                if let Some(entry) = self
                    .current_message
                    .as_ref()
                    .and_then(|id| self.messages.get_mut(id))
                {
                    entry.1 = attr(e, "correlationKey")?;
                }
            }
            "error" => {
                let id = required_attr(e, tag, "id")?;
                self.errors.insert(id, attr(e, "errorCode")?);
            }
            "sequenceFlow" => {
                let source = required_attr(e, tag, "sourceRef")?;
                let target = required_attr(e, tag, "targetRef")?;
                self.flows.push((source, target));
            }
            "exclusiveGateway" | "parallelGateway" | "inclusiveGateway" | "eventBasedGateway"
            | "complexGateway" | "userTask" | "scriptTask" | "sendTask" | "receiveTask"
            | "businessRuleTask" | "manualTask" | "task" | "subProcess" | "callActivity"
                if self.in_process =>
            {
                let id = attr(e, "id")?.unwrap_or_default();
                return Err(rejected(format!(
                    "unsupported element <{tag}> '{id}'; only linear processes of service tasks and events are supported"
                )));
            }
            _ => {}
        }

        Ok(())
    }

    fn close(&mut self, tag: &str) {
        match tag {
            "process" => self.in_process = false,
            "message" => self.current_message = None,
            _ => {
                if self.current.as_ref().is_some_and(|draft| draft.tag == tag) {
                    if let Some(draft) = self.current.take() {
                        self.nodes.push(draft);
                    }
                }
            }
        }
    }

    fn build(self) -> Result<ProcessModel, GatewayError> {
        let id = self
            .process_id
            .ok_or_else(|| rejected("resource contains no <process> element".to_string()))?;

        let mut elements = HashMap::with_capacity(self.nodes.len());
        for draft in self.nodes {
            let element_id = draft.id.clone();
            let kind = element_kind(draft, &self.messages, &self.errors)?;
            let element = Element {
                id: element_id.clone(),
                kind,
                outgoing: None,
            };
            if elements.insert(element_id.clone(), element).is_some() {
                return Err(rejected(format!("duplicate element id '{element_id}'")));
            }
        }

        for (source, target) in self.flows {
            if !elements.contains_key(&target) {
                return Err(rejected(format!(
                    "sequence flow targets unknown element '{target}'"
                )));
            }
            let Some(element) = elements.get_mut(&source) else {
                return Err(rejected(format!(
                    "sequence flow starts at unknown element '{source}'"
                )));
            };
            if element.outgoing.is_some() {
                return Err(rejected(format!(
                    "element '{source}' has more than one outgoing sequence flow; only linear processes are supported"
                )));
            }
            element.outgoing = Some(target);
        }

        let mut starts = elements
            .values()
            .filter(|e| matches!(e.kind, ElementKind::Start))
            .map(|e| e.id.clone());
        let start = match (starts.next(), starts.next()) {
            (Some(start), None) => start,
            (None, _) => return Err(rejected(format!("process '{id}' has no start event"))),
            (Some(_), Some(_)) => {
                return Err(rejected(format!(
                    "process '{id}' has more than one start event"
                )));
            }
        };

        for element in elements.values() {
            if let ElementKind::ErrorBoundary { attached_to, .. } = &element.kind {
                let attached = elements.get(attached_to);
                if !matches!(attached.map(|e| &e.kind), Some(ElementKind::ServiceTask(_))) {
                    return Err(rejected(format!(
                        "boundary event '{}' must be attached to a service task, not '{attached_to}'",
                        element.id
                    )));
                }
            }
        }

        // Every chain of flows must end; the token walker has no step limit.
        for element in elements.values() {
            let mut visited = HashSet::new();
            let mut next = Some(element.id.as_str());
            while let Some(current) = next {
                if !visited.insert(current) {
                    return Err(rejected(format!(
                        "sequence flows loop back to element '{current}'; only linear processes are supported"
                    )));
                }
                next = elements.get(current).and_then(|e| e.outgoing.as_deref());
            }
        }

        Ok(ProcessModel {
            id,
            start,
            elements,
        })
    }
}

fn element_kind(
    draft: Draft,
    messages: &HashMap<String, (String, Option<String>)>,
    errors: &HashMap<String, Option<String>>,
) -> Result<ElementKind, GatewayError> {
    let id = draft.id;
    if let Some(definition) = draft.unsupported_definition {
        return Err(rejected(format!(
            "element '{id}' uses unsupported <{definition}>"
        )));
    }

    let plain = draft.message_ref.is_none() && draft.error_definition.is_none();
    match draft.tag.as_str() {
        "startEvent" if plain => Ok(ElementKind::Start),
        "endEvent" if plain => Ok(ElementKind::End),
        "intermediateThrowEvent" if plain => Ok(ElementKind::Pass),
        "serviceTask" => {
            let job_type = draft
                .job_type
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    rejected(format!(
                        "service task '{id}' has no zeebe:taskDefinition type"
                    ))
                })?;
            let retries = match draft.retries {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    rejected(format!("service task '{id}' has invalid retries '{raw}'"))
                })?,
                None => DEFAULT_RETRIES,
            };
            Ok(ElementKind::ServiceTask(TaskDefinition {
                job_type,
                retries,
                headers: draft.headers,
            }))
        }
        "intermediateCatchEvent" => {
            let message_ref = draft.message_ref.ok_or_else(|| {
                rejected(format!(
                    "catch event '{id}' must have a message event definition"
                ))
            })?;
            let (name, correlation_key) = messages
                .get(&message_ref)
                .ok_or_else(|| rejected(format!("catch event '{id}' references unknown message '{message_ref}'")))?;
            let correlation_key = correlation_key.clone().ok_or_else(|| {
                rejected(format!(
                    "message '{name}' has no zeebe:subscription correlationKey"
                ))
            })?;
            Ok(ElementKind::MessageCatch(MessageDefinition {
                name: name.clone(),
                correlation_key,
            }))
        }
        "boundaryEvent" => {
            let Some(error_ref) = draft.error_definition else {
                return Err(rejected(format!(
                    "boundary event '{id}' must have an error event definition"
                )));
            };
            let attached_to = draft.attached_to.ok_or_else(|| {
                rejected(format!("boundary event '{id}' has no attachedToRef"))
            })?;
            let error_code = match error_ref {
                Some(error_ref) => errors.get(&error_ref).cloned().ok_or_else(|| {
                    rejected(format!(
                        "boundary event '{id}' references unknown error '{error_ref}'"
                    ))
                })?,
                None => None,
            };
            Ok(ElementKind::ErrorBoundary {
                attached_to,
                error_code,
            })
        }
        tag => Err(rejected(format!(
            "element <{tag}> '{id}' has an unsupported event definition"
        ))),
    }
}
