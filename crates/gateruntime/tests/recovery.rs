//! Restarting partitions from their logs and recovering from lost or
//! duplicated subscription commands.

mod common;

use common::{vars, TestCluster, RESEND_TIMEOUT_MS};
use gatecore::codec::SubscriptionCommand;
use gatecore::record::{
    BpmnElementType, MessageSubscriptionIntent, WorkflowInstanceIntent, WorkflowInstanceRecord,
    WorkflowInstanceSubscriptionIntent,
};
use gatecore::{
    decode_local_key, NodeSpec, ProcessDefinition, Record, RejectionType, START_PARTITION_ID,
};
use serde_json::json;

fn single_catch() -> ProcessDefinition {
    ProcessDefinition::new("payment")
        .with_node(NodeSpec::start("start"))
        .with_node(NodeSpec::message_catch("wait-payment", "payment", "orderId"))
        .with_node(NodeSpec::end("end"))
        .connect("to-wait", "start", "wait-payment")
        .connect("to-end", "wait-payment", "end")
}

/// Stays active after the first correlation.
fn payment_then_shipment() -> ProcessDefinition {
    ProcessDefinition::new("payment-shipment")
        .with_node(NodeSpec::start("start"))
        .with_node(NodeSpec::message_catch("wait-payment", "payment", "orderId"))
        .with_node(NodeSpec::message_catch("wait-shipment", "shipment", "orderId"))
        .with_node(NodeSpec::end("end"))
        .connect("to-payment", "start", "wait-payment")
        .connect("to-shipment", "wait-payment", "wait-shipment")
        .connect("to-end", "wait-shipment", "end")
}

#[test]
fn restarted_partitions_continue_where_they_stopped() {
    let mut cluster = TestCluster::with_process(2, single_catch());
    let key = cluster.create_instance("payment", vars(json!({ "orderId": "order-1" })));
    cluster.deliver_all();

    let message_partition = cluster.partition_of_key("order-1");
    let logged = cluster.all_records().len();
    cluster.restart(START_PARTITION_ID);
    cluster.restart(message_partition);
    assert_eq!(cluster.all_records().len(), logged);
    assert!(cluster.pending().is_empty());

    let state = cluster.processor(START_PARTITION_ID).state();
    assert!(state.elements.get(key).is_some());
    assert_eq!(state.instance_subscriptions.len(), 1);
    assert_eq!(
        cluster
            .processor(message_partition)
            .state()
            .message_subscriptions
            .len(),
        1
    );

    cluster.publish("payment", "order-1", vars(json!({})), 0);
    cluster.deliver_all();
    assert!(cluster.is_completed(key));
}

#[test]
fn keys_keep_increasing_after_restart() {
    let mut cluster = TestCluster::with_process(1, single_catch());
    let first = cluster.create_instance("payment", vars(json!({ "orderId": "a" })));
    let highest = cluster
        .records(START_PARTITION_ID)
        .iter()
        .map(|r| r.key)
        .max()
        .unwrap();

    cluster.restart(START_PARTITION_ID);
    let second = cluster.create_instance("payment", vars(json!({ "orderId": "b" })));

    assert!(second > highest);
    assert!(decode_local_key(second) > decode_local_key(first));
}

#[test]
fn logged_command_without_follow_ups_is_processed_on_restart() {
    let mut cluster = TestCluster::with_process(1, single_catch());
    let value = WorkflowInstanceRecord::new("payment", -1, -1, "payment", BpmnElementType::Process)
        .with_variables(vars(json!({ "orderId": "order-2" })));
    cluster.append_command(
        START_PARTITION_ID,
        Record::command(-1, WorkflowInstanceIntent::Create, value),
    );

    cluster.restart(START_PARTITION_ID);

    let activating = cluster.events(WorkflowInstanceIntent::ElementActivating);
    assert!(activating
        .iter()
        .any(|r| r.workflow_instance().unwrap().element_id == "payment"));
    assert!(activating.iter().all(|r| r.source_position.is_some()));
    assert_eq!(cluster.pending().len(), 1);

    // a second restart finds nothing left to do
    let logged = cluster.records(START_PARTITION_ID).len();
    cluster.restart(START_PARTITION_ID);
    assert_eq!(cluster.records(START_PARTITION_ID).len(), logged);
}

#[test]
fn lost_open_is_resent_by_the_sweep() {
    let mut cluster = TestCluster::with_process(2, single_catch());
    let key = cluster.create_instance("payment", vars(json!({ "orderId": "order-3" })));
    assert!(matches!(
        cluster.drop_next(),
        Some((_, SubscriptionCommand::OpenMessageSubscription(_)))
    ));

    // the pending open survives a restart
    cluster.restart(START_PARTITION_ID);
    cluster.advance_clock(RESEND_TIMEOUT_MS as i64);
    cluster.sweep_all();
    let pending = cluster.pending();
    assert_eq!(pending.len(), 1);
    assert!(matches!(
        pending[0].1,
        SubscriptionCommand::OpenMessageSubscription(_)
    ));

    cluster.deliver_all();
    assert_eq!(cluster.events(WorkflowInstanceSubscriptionIntent::Opened).len(), 1);

    cluster.publish("payment", "order-3", vars(json!({})), 0);
    cluster.deliver_all();
    assert!(cluster.is_completed(key));
}

#[test]
fn duplicate_open_is_acknowledged_again() {
    let mut cluster = TestCluster::with_process(2, single_catch());
    cluster.create_instance("payment", vars(json!({ "orderId": "order-4" })));
    let (partition_id, open) = cluster.pending().remove(0);

    cluster.deliver_all();
    cluster.deliver(partition_id, &open.encode().unwrap());

    assert_eq!(
        cluster.rejections(MessageSubscriptionIntent::Open)[0]
            .rejection
            .as_ref()
            .unwrap()
            .rejection_type,
        RejectionType::AlreadyExists
    );
    let pending = cluster.pending();
    assert!(matches!(
        pending.as_slice(),
        [(_, SubscriptionCommand::OpenWorkflowInstanceSubscription(_))]
    ));
    cluster.deliver_all();
    assert_eq!(cluster.events(MessageSubscriptionIntent::Opened).len(), 1);
}

#[test]
fn lost_correlation_is_resent_and_duplicates_are_ignored() {
    let mut cluster = TestCluster::with_process(2, payment_then_shipment());
    let key = cluster.create_instance("payment-shipment", vars(json!({ "orderId": "order-5" })));
    cluster.deliver_all();

    cluster.publish("payment", "order-5", vars(json!({ "paid": true })), 60_000);
    assert!(matches!(
        cluster.drop_next(),
        Some((_, SubscriptionCommand::CorrelateWorkflowInstanceSubscription(_)))
    ));

    cluster.advance_clock(RESEND_TIMEOUT_MS as i64);
    cluster.sweep_all();
    let (partition_id, correlate) = cluster.pending().remove(0);
    assert!(matches!(
        correlate,
        SubscriptionCommand::CorrelateWorkflowInstanceSubscription(_)
    ));

    cluster.deliver_all();
    assert!(cluster
        .element_ids(WorkflowInstanceIntent::ElementCompleted)
        .contains(&"wait-payment".to_string()));

    // a late copy is refused as a duplicate but acknowledged again
    cluster.deliver(partition_id, &correlate.encode().unwrap());
    assert_eq!(
        cluster.rejections(WorkflowInstanceSubscriptionIntent::Correlate)[0]
            .rejection
            .as_ref()
            .unwrap()
            .rejection_type,
        RejectionType::AlreadyExists
    );
    let pending = cluster.pending();
    assert!(matches!(
        pending.as_slice(),
        [(_, SubscriptionCommand::CorrelateMessageSubscription(_))]
    ));
    cluster.deliver_all();

    assert_eq!(cluster.events(WorkflowInstanceSubscriptionIntent::Correlated).len(), 1);
    assert_eq!(cluster.events(MessageSubscriptionIntent::Correlated).len(), 1);
    assert!(cluster.events(MessageSubscriptionIntent::Rejected).is_empty());

    cluster.publish("shipment", "order-5", vars(json!({})), 0);
    cluster.deliver_all();
    assert!(cluster.is_completed(key));
    assert_eq!(
        cluster.process_variables(key).unwrap()["paid"],
        gatecore::Value::Bool(true)
    );
}

#[test]
fn resent_correlation_after_completion_closes_the_message_subscription() {
    let mut cluster = TestCluster::with_process(2, single_catch());
    let key = cluster.create_instance("payment", vars(json!({ "orderId": "order-6" })));
    cluster.deliver_all();

    cluster.publish("payment", "order-6", vars(json!({})), 60_000);
    assert!(cluster.deliver_next());
    assert!(cluster.is_completed(key));
    assert!(matches!(
        cluster.drop_next(),
        Some((_, SubscriptionCommand::CorrelateMessageSubscription(_)))
    ));

    cluster.advance_clock(RESEND_TIMEOUT_MS as i64);
    cluster.sweep_all();
    let pending = cluster.pending();
    assert!(matches!(
        pending.as_slice(),
        [(_, SubscriptionCommand::CorrelateWorkflowInstanceSubscription(_))]
    ));
    cluster.deliver_all();

    let message_partition = cluster.partition_of_key("order-6");
    assert!(cluster
        .processor(message_partition)
        .state()
        .message_subscriptions
        .is_empty());
    assert!(cluster
        .processor(START_PARTITION_ID)
        .state()
        .instance_subscriptions
        .is_empty());
    assert_eq!(cluster.events(MessageSubscriptionIntent::Closed).len(), 1);
    assert_eq!(cluster.events(WorkflowInstanceSubscriptionIntent::Correlated).len(), 1);

    // nothing is left to resend
    cluster.advance_clock(RESEND_TIMEOUT_MS as i64);
    cluster.sweep_all();
    assert!(cluster.pending().is_empty());
}
