use log::debug;
use std::sync::mpsc::Sender;

use super::event::Event;
use crate::fxp::model::Node;

/// One link of the chat-message processing chain.  Every stanza classified
/// as a chat message is offered to each processor in turn; those that match
/// turn it into application events.
pub trait Processor {
    fn matches(&self, node: &Node) -> bool;
    fn process(&self, node: &Node, events: &Sender<Event>);
}

/// Extracts plain text messages and re-emits them as `Event::Message`.
pub struct TextMessage;

impl Processor for TextMessage {
    fn matches(&self, node: &Node) -> bool {
        node.find("notify").is_some() && node.find("body").is_some()
    }

    fn process(&self, node: &Node, events: &Sender<Event>) {
        let sender_name = node
            .find("notify")
            .and_then(|n| n.attribute("name"))
            .unwrap_or_default();
        let body = node.find("body").map(|b| b.data()).unwrap_or_default();

        let _ = events.send(Event::Message {
            from: node.attribute("from").unwrap_or_default().to_string(),
            id: node.attribute("id").unwrap_or_default().to_string(),
            sender_name: sender_name.to_string(),
            body: String::from_utf8_lossy(body).into_owned(),
            author: node.attribute("author").map(str::to_string),
        });
    }
}

/// The default chain.
pub fn default_processors() -> Vec<Box<dyn Processor>> {
    vec![Box::new(TextMessage)]
}

pub(super) fn run(processors: &[Box<dyn Processor>], node: &Node, events: &Sender<Event>) {
    let mut matched = false;
    for processor in processors {
        if processor.matches(node) {
            processor.process(node, events);
            matched = true;
        }
    }
    if !matched {
        debug!("No processor claimed message stanza {}", node.attribute("id").unwrap_or("?"));
    }
}

#[cfg(test)]
use std::sync::mpsc::channel;

#[test]
fn test_text_message_extraction() {
    let (tx, rx) = channel();
    let node = Node::new("message")
        .attr("from", "44790000000-1400000000@g.us")
        .attr("id", "message-1415000000-7")
        .attr("author", "44790000000@s.whatsapp.net")
        .child(Node::new("notify").attr("name", "Alice"))
        .child(Node::new("body").with_data(&b"group hello"[..]));

    run(&default_processors(), &node, &tx);

    assert_eq!(
        rx.try_recv().unwrap(),
        Event::Message {
            from: "44790000000-1400000000@g.us".to_string(),
            id: "message-1415000000-7".to_string(),
            sender_name: "Alice".to_string(),
            body: "group hello".to_string(),
            author: Some("44790000000@s.whatsapp.net".to_string()),
        }
    );
}

#[test]
fn test_bodyless_message_is_ignored() {
    let (tx, rx) = channel();
    let node = Node::new("message")
        .attr("from", "1@s.whatsapp.net")
        .child(Node::new("notify").attr("name", "Bob"));

    run(&default_processors(), &node, &tx);
    assert!(rx.try_recv().is_err());
}
