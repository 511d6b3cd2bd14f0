//! A player leaving mid-game disappears everywhere; the game goes on.

mod common;

use common::Arena;
use kestrel_game::PaddleInput;
use kestrel_net::{LossyLink, Packet, PacketCodec, PlayerInput, SessionId};
use kestrel_sync::ConnectionStatus;

#[test]
fn test_departed_player_is_removed_and_ignored() {
    let mut arena = Arena::new();
    arena.join("peer-1", LossyLink::perfect(), LossyLink::perfect());
    arena.join("peer-2", LossyLink::perfect(), LossyLink::perfect());
    arena.client(0).set_input(PaddleInput::new(1, 0));
    arena.client(1).set_input(PaddleInput::new(-1, 1));
    arena.run(90);

    let gone = SessionId::new("peer-2");
    let (gone_id, _) = arena.server.player(&gone).unwrap();
    assert!(arena.client(0).entities().get(gone_id).is_some());

    arena.disconnect(1);
    arena.run(1);

    assert!(arena.server.player(&gone).is_none());
    assert!(arena.server.entities().get(gone_id).is_none());
    let snapshot = arena.server.take_snapshot();
    assert!(snapshot.entity(gone_id.0).is_none());
    assert!(snapshot.entities.iter().all(|e| e.owner.as_ref() != Some(&gone)));
    assert_eq!(arena.client(1).status(), ConnectionStatus::Disconnected);

    // Input still arriving from the departed session goes nowhere.
    let tick = arena.server.simulated_tick().unwrap() + 2;
    let input = postcard::to_allocvec(&PaddleInput::new(1, 1)).unwrap();
    let bytes = PacketCodec::default()
        .encode(&Packet::PlayerInput(PlayerInput { tick, input }))
        .unwrap();
    let before = arena.server.stats();
    arena.server.sessions_mut().receive(&gone, &bytes);
    arena.run(30);

    let after = arena.server.stats();
    assert_eq!(after.ticks, before.ticks + 30);
    assert!(arena.server.player(&gone).is_none());
    assert!(arena.server.take_snapshot().entity(gone_id.0).is_none());

    // The remaining client dropped the entity and still plays.
    let remaining = arena.client(0);
    assert!(remaining.entities().get(gone_id).is_none());
    assert_eq!(remaining.status(), ConnectionStatus::Connected);
    assert!(remaining.controlled().is_some());
}
