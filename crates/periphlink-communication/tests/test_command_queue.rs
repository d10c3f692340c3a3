use periphlink_communication::{
    CommandQueue, GcodeResponseClassifier, LineClass, PendingCommand, ResponseFuture,
};
use periphlink_core::{CommandError, ProtocolError};

fn enqueue(queue: &mut CommandQueue, command: &str) -> ResponseFuture {
    let (future, responder) = ResponseFuture::channel(command);
    assert!(queue.push(PendingCommand::new(command, responder)));
    future
}

fn feed(queue: &mut CommandQueue, lines: &[&str]) -> Vec<ProtocolError> {
    let classifier = GcodeResponseClassifier::new();
    lines
        .iter()
        .filter_map(|line| queue.accept(line, classifier.classify(line)).err())
        .collect()
}

#[tokio::test]
async fn test_blocks_resolve_in_command_order() {
    let mut queue = CommandQueue::new(10);
    let c1 = enqueue(&mut queue, "M114");
    let c2 = enqueue(&mut queue, "G28");
    let c3 = enqueue(&mut queue, "M114");

    let errors = feed(
        &mut queue,
        &[
            "X:1.00 Y:2.00 Z:3.00 E:0.00",
            "X:1.00 Y:2.00 Z:3.00 E:0.00",
            "ok",
            "echo:busy: processing",
            "ok",
            "X:0.00 Y:0.00 Z:0.00 E:0.00",
            "ok",
        ],
    );
    assert!(errors.is_empty());

    let b1 = c1.await.unwrap();
    assert_eq!(b1.command.as_deref(), Some("M114"));
    assert_eq!(b1.len(), 3);
    assert_eq!(b1.payload().len(), 2);

    let b2 = c2.await.unwrap();
    assert_eq!(b2.command.as_deref(), Some("G28"));
    assert_eq!(b2.lines, vec!["ok"]);

    let b3 = c3.await.unwrap();
    assert_eq!(b3.lines, vec!["X:0.00 Y:0.00 Z:0.00 E:0.00", "ok"]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_orphan_end_is_discarded() {
    let mut queue = CommandQueue::new(10);

    let errors = feed(&mut queue, &["X:5.00 Y:5.00 Z:5.00", "ok"]);
    assert_eq!(
        errors,
        vec![ProtocolError::OrphanResponse {
            lines: vec!["X:5.00 Y:5.00 Z:5.00".to_string(), "ok".to_string()]
        }]
    );

    // The orphan block does not leak into the next command's response
    let next = enqueue(&mut queue, "G28");
    assert!(feed(&mut queue, &["ok"]).is_empty());
    assert_eq!(next.await.unwrap().lines, vec!["ok"]);
}

#[tokio::test]
async fn test_unknown_line_is_reported_not_fatal() {
    let mut queue = CommandQueue::new(10);
    let pending = enqueue(&mut queue, "G999");

    let errors = feed(&mut queue, &["Unknown command: \"G999\"", "ok"]);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ProtocolError::UnrecognizedLine { .. }));

    let block = pending.await.unwrap();
    assert_eq!(block.lines, vec!["ok"]);
}

#[tokio::test]
async fn test_cancel_rejects_every_pending_command() {
    let mut queue = CommandQueue::new(10);
    let c1 = enqueue(&mut queue, "G28");
    let c2 = enqueue(&mut queue, "M114");
    queue.accept("X:1 Y:1 Z:1", LineClass::Partial).unwrap();

    assert_eq!(queue.cancel_all(), 2);
    assert!(queue.partial_lines().is_empty());
    assert_eq!(
        c1.await,
        Err(CommandError::Cancelled {
            command: "G28".to_string()
        })
    );
    assert_eq!(
        c2.await,
        Err(CommandError::Cancelled {
            command: "M114".to_string()
        })
    );
    assert_eq!(queue.cancel_all(), 0);
}
