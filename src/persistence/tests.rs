use super::{DurableHandle, Persistence, Settlement};
use crate::broker::ack::DeliveryState;
use crate::broker::message::{
    AckKind, Durability, EndpointId, Message, MessageHeader, MessageId, TargetKind,
};
use crate::broker::topic::{OverflowPolicy, TopicConfig};
use crate::config::StorageSettings;

fn durable_message(topic: &str, id: u64, max_receivers: u32, expire_at: i64) -> Message {
    Message {
        id: MessageId(id),
        header: MessageHeader::new(topic, ["s"], TargetKind::Durable)
            .ack_kind(AckKind::Received)
            .durability(Durability {
                expire_at,
                max_receivers,
            }),
        payload: format!("msg{id}").into(),
        created_at: 0,
    }
}

fn archiving() -> Persistence {
    Persistence::open(&StorageSettings {
        archive_settled: true,
        ..StorageSettings::temporary()
    })
    .unwrap()
}

#[test]
fn test_persist_requires_durability() {
    let persistence = Persistence::temporary().unwrap();
    let mut message = durable_message("t", 1, 1, i64::MAX);
    message.header.durability = None;
    assert!(persistence.persist(&message).is_err());
}

#[test]
fn test_restore_yields_messages_in_id_order() {
    let persistence = Persistence::temporary().unwrap();
    for id in [300, 2, 17] {
        persistence
            .persist(&durable_message("t", id, 1, i64::MAX))
            .unwrap();
    }

    let ids: Vec<u64> = persistence
        .restore("t")
        .unwrap()
        .iter()
        .map(|stored| stored.message.id.0)
        .collect();
    assert_eq!(ids, vec![2, 17, 300]);
    assert!(persistence.restore("other").unwrap().is_empty());
}

#[test]
fn test_quota_settles_once() {
    let persistence = archiving();
    let handle = persistence
        .persist(&durable_message("t", 1, 2, i64::MAX))
        .unwrap();

    // below the settling level
    assert!(
        !persistence
            .mark_delivered(&handle, EndpointId(1), DeliveryState::Sent)
            .unwrap()
    );
    assert!(
        !persistence
            .mark_delivered(&handle, EndpointId(1), DeliveryState::Received)
            .unwrap()
    );
    // the same endpoint does not count twice
    assert!(
        !persistence
            .mark_delivered(&handle, EndpointId(1), DeliveryState::Processed)
            .unwrap()
    );
    assert_eq!(persistence.restore("t").unwrap()[0].settled_receivers, 1);

    assert!(
        persistence
            .mark_delivered(&handle, EndpointId(2), DeliveryState::Received)
            .unwrap()
    );
    assert!(persistence.is_settled(&handle));
    assert!(!persistence.settle(&handle, Settlement::Expired).unwrap());

    let archived = persistence.archived("t").unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].settlement, Settlement::QuotaReached);
}

#[test]
fn test_sweep_expired_is_idempotent() {
    let persistence = archiving();
    persistence
        .persist(&durable_message("t", 1, 1, 1_000))
        .unwrap();
    persistence
        .persist(&durable_message("t", 2, 1, 5_000))
        .unwrap();

    let expired = persistence.sweep_expired(2_000);
    assert_eq!(
        expired,
        vec![DurableHandle {
            topic: "t".to_string(),
            message_id: MessageId(1),
        }]
    );
    assert!(persistence.sweep_expired(2_000).is_empty());
    assert_eq!(persistence.unsettled("t"), 1);

    // an ack that lost the race is a no-op
    assert!(
        !persistence
            .mark_delivered(&expired[0], EndpointId(1), DeliveryState::Received)
            .unwrap()
    );
    assert_eq!(
        persistence.archived("t").unwrap()[0].settlement,
        Settlement::Expired
    );
}

#[test]
fn test_settled_messages_are_deleted_without_archive() {
    let persistence = Persistence::temporary().unwrap();
    let handle = persistence
        .persist(&durable_message("t", 1, 1, i64::MAX))
        .unwrap();
    assert!(persistence.settle(&handle, Settlement::Evicted).unwrap());
    assert!(persistence.restore("t").unwrap().is_empty());
    assert!(persistence.archived("t").unwrap().is_empty());
}

#[test]
fn test_topics_and_id_ceilings_round_trip() {
    let persistence = Persistence::temporary().unwrap();
    let config = TopicConfig::new("orders").overflow(OverflowPolicy::DropOld, 16);
    persistence.save_topic(&config).unwrap();
    persistence.reserve_ids("orders", 2048).unwrap();

    assert_eq!(persistence.load_topics().unwrap(), vec![config]);
    assert_eq!(persistence.id_ceiling("orders").unwrap(), Some(2048));
    assert_eq!(persistence.id_ceiling("missing").unwrap(), None);

    persistence.remove_topic("orders").unwrap();
    assert!(persistence.load_topics().unwrap().is_empty());
    assert_eq!(persistence.id_ceiling("orders").unwrap(), None);
}
