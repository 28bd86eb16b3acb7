use trackerdcs::error::DcsError;
use trackerdcs::registers::{encode_f32, Chunk, RegisterKind, RegisterManager, RegisterValue};
use trackerdcs::sim::SimulatedBus;

fn manager(bus: &SimulatedBus, max_chunk_len: Option<u16>) -> RegisterManager {
    RegisterManager::new(Box::new(bus.clone()), max_chunk_len)
}

#[test]
fn test_int_and_float_share_one_chunk() {
    let bus = SimulatedBus::new();
    let mut registers = manager(&bus, None);
    registers.add_register("mode", 10, RegisterKind::Int16, false).unwrap();
    registers.add_register("temperature", 11, RegisterKind::Float32, false).unwrap();

    assert_eq!(registers.chunks(), &[Chunk { start: 10, len: 3 }]);

    registers.refresh().unwrap();
    assert_eq!(bus.reads(), [(10, 3)]);
}

#[test]
fn test_gaps_split_chunks_and_cap_applies() {
    let bus = SimulatedBus::new();
    let mut registers = manager(&bus, Some(2));
    for (name, address) in [("a", 0), ("b", 1), ("c", 2), ("d", 7)] {
        registers.add_register(name, address, RegisterKind::Int16, false).unwrap();
    }
    assert_eq!(
        registers.chunks(),
        &[
            Chunk { start: 0, len: 2 },
            Chunk { start: 2, len: 1 },
            Chunk { start: 7, len: 1 },
        ]
    );
    registers.refresh().unwrap();
    assert_eq!(bus.reads().len(), 3);
}

#[test]
fn test_decode_after_refresh() {
    let bus = SimulatedBus::new();
    let [lo, hi] = encode_f32(-31.5);
    bus.set_word(4, lo);
    bus.set_word(5, hi);
    bus.set_word(6, 0b1010);
    bus.set_word(7, 42);

    let mut registers = manager(&bus, None);
    registers.add_register("temp", 4, RegisterKind::Float32, false).unwrap();
    registers.add_register("flag_1", 6, RegisterKind::Bool { bit: 1 }, false).unwrap();
    registers.add_register("flag_2", 6, RegisterKind::Bool { bit: 2 }, false).unwrap();
    registers.add_register("count", 7, RegisterKind::Int16, false).unwrap();

    assert_eq!(registers.read("temp").unwrap(), None);
    assert!(registers.refresh().unwrap());
    assert_eq!(registers.read("temp").unwrap(), Some(RegisterValue::Float(-31.5)));
    assert_eq!(registers.read("flag_1").unwrap(), Some(RegisterValue::Bool(true)));
    assert_eq!(registers.read("flag_2").unwrap(), Some(RegisterValue::Bool(false)));
    assert_eq!(registers.read("count").unwrap(), Some(RegisterValue::Int(42)));

    // Unchanged words report no change
    assert!(!registers.refresh().unwrap());

    let values = registers.values();
    assert_eq!(values["count"], 42);
    assert_eq!(values["flag_1"], true);
}

#[test]
fn test_bit_write_preserves_other_bits() {
    let bus = SimulatedBus::new();
    bus.set_word(3, 0b1001);
    let mut registers = manager(&bus, None);
    registers.add_register("run", 3, RegisterKind::Bool { bit: 1 }, true).unwrap();

    // Cache is stale (never refreshed); the write re-reads the word first
    registers.write("run", 1.0).unwrap();
    assert_eq!(bus.word(3), 0b1011);

    bus.set_word(3, 0b1111_0010);
    registers.write("run", 0.0).unwrap();
    assert_eq!(bus.word(3), 0b1111_0000);
    assert_eq!(registers.read("run").unwrap(), Some(RegisterValue::Bool(false)));
}

#[test]
fn test_float_write_is_low_word_first() {
    let bus = SimulatedBus::new();
    let mut registers = manager(&bus, None);
    registers.add_register("setpoint", 20, RegisterKind::Float32, true).unwrap();
    registers.write("setpoint", 12.5).unwrap();

    let expected = encode_f32(12.5);
    assert_eq!(bus.writes(), [(20, expected.to_vec())]);
    assert_eq!(registers.read("setpoint").unwrap(), Some(RegisterValue::Float(12.5)));
}

#[test]
fn test_write_rejections() {
    let bus = SimulatedBus::new();
    let mut registers = manager(&bus, None);
    registers.add_register("status", 0, RegisterKind::Int16, false).unwrap();
    registers.add_register("speed", 1, RegisterKind::Int16, true).unwrap();

    assert!(registers.write("status", 1.0).unwrap_err().is_rejection());
    assert!(registers.write("missing", 1.0).unwrap_err().is_rejection());
    assert!(registers.write("speed", 1.5).unwrap_err().is_rejection());
    assert!(registers.write("speed", 70000.0).unwrap_err().is_rejection());
    assert!(bus.writes().is_empty());
}

#[test]
fn test_duplicate_and_out_of_space_registers() {
    let bus = SimulatedBus::new();
    let mut registers = manager(&bus, None);
    registers.add_register("a", 0, RegisterKind::Int16, false).unwrap();
    assert!(matches!(
        registers.add_register("a", 5, RegisterKind::Int16, false),
        Err(DcsError::Configuration(_))
    ));
    assert!(registers.add_register("edge", u16::MAX, RegisterKind::Float32, false).is_err());
}

#[test]
fn test_bus_failure_is_communication_failure() {
    let bus = SimulatedBus::new();
    let mut registers = manager(&bus, None);
    registers.add_register("status", 0, RegisterKind::Int16, true).unwrap();

    bus.set_failing(true);
    assert!(registers.refresh().unwrap_err().is_communication_failure());
    assert!(registers.write("status", 1.0).unwrap_err().is_communication_failure());
    assert!(registers.connect().unwrap_err().is_communication_failure());
}

#[test]
fn test_long_runs_respect_transaction_limit() {
    let bus = SimulatedBus::new();
    let mut registers = manager(&bus, None);
    for address in 0..130u16 {
        registers
            .add_register(&format!("r{}", address), address, RegisterKind::Int16, false)
            .unwrap();
    }
    assert_eq!(
        registers.chunks(),
        &[Chunk { start: 0, len: 125 }, Chunk { start: 125, len: 5 }]
    );
}
