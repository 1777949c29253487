//! Loader contract tests: validation, ordering, fail-fast, entry point.

mod common;

use common::*;
use kpio_elf32::{
    is_elf, load, ByteOrder, Elf32Loader, ElfError, FlatMemoryMapper, LoadError, LoaderConfig,
    MapSegment, Segment, SharedMapper,
};

#[test]
fn validator_accepts_only_exact_magic() {
    let mut buffer = vec![0x7F, b'E', b'L', b'F', 0x01, 0x02];
    assert!(is_elf(&buffer));

    for i in 0..4 {
        let original = buffer[i];
        buffer[i] ^= 0x20;
        assert!(!is_elf(&buffer), "byte {} changed", i);
        buffer[i] = original;
    }
}

#[test]
fn short_buffer_is_not_elf() {
    for len in 0..4 {
        let buffer = &[0x7F, b'E', b'L', b'F'][..len];
        let mut mapper = RecordingMapper::default();
        assert_eq!(
            load(buffer, &mut mapper),
            Err(LoadError::Format(ElfError::NotElf))
        );
        assert!(mapper.calls.is_empty());
    }
}

#[test]
fn zeroed_buffer_is_not_elf() {
    let buffer = [0u8; 100];
    let mut mapper = RecordingMapper::default();
    assert_eq!(
        load(&buffer, &mut mapper),
        Err(LoadError::Format(ElfError::NotElf))
    );
    assert!(mapper.calls.is_empty());
}

#[test]
fn magic_without_header_is_truncated() {
    let mut mapper = RecordingMapper::default();
    assert_eq!(
        load(&[0x7F, b'E', b'L', b'F'], &mut mapper),
        Err(LoadError::Format(ElfError::TruncatedHeader))
    );
    assert!(mapper.calls.is_empty());
}

#[test]
fn loadable_segments_are_mapped_in_table_order() {
    let base = payload_offset(3);
    let phdrs = [
        [PT_NOTE, base, 0x0000_0000, 0, 4, 4, 0, 4],
        [PT_LOAD, base, 0x0040_0000, 0, 8, 0x100, PF_R | PF_X, 0x1000],
        [PT_LOAD, base + 8, 0x1000_0000, 0, 4, 0x2000, PF_R | PF_W, 0x1000],
    ];
    let payload = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
    let elf = create_elf(0x0040_0000, &phdrs, &payload);

    let mut mapper = RecordingMapper::default();
    assert_eq!(load(&elf, &mut mapper), Ok(0x0040_0000));

    assert_eq!(
        mapper.calls,
        vec![
            MapCall {
                vaddr: 0x0040_0000,
                mem_size: 0x100,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
                file_size: 8,
            },
            MapCall {
                vaddr: 0x1000_0000,
                mem_size: 0x2000,
                data: vec![9, 10, 11, 12],
                file_size: 4,
            },
        ]
    );
}

#[test]
fn mapping_failure_stops_iteration() {
    let seg = [PT_LOAD, 0, 0x1000, 0, 0, 0x1000, PF_R, 0x1000];
    let elf = create_elf(0x1000, &[seg, seg, seg], &[]);

    let mut mapper = RecordingMapper::failing_on(2);
    assert_eq!(
        load(&elf, &mut mapper),
        Err(LoadError::MappingFailed(MapFailure { call: 2 }))
    );
    assert_eq!(mapper.calls.len(), 2);
}

#[test]
fn entry_point_without_program_headers() {
    let elf = create_elf(0x0010_0020, &[], &[]);

    let mut mapper = RecordingMapper::default();
    assert_eq!(load(&elf, &mut mapper), Ok(0x0010_0020));
    assert!(mapper.calls.is_empty());
}

#[test]
fn repeated_loads_are_identical() {
    let base = payload_offset(2);
    let phdrs = [
        [PT_LOAD, base, 0x0040_0000, 0, 2, 2, PF_R | PF_X, 0],
        [PT_LOAD, base + 2, 0x0050_0000, 0, 2, 8, PF_R | PF_W, 0],
    ];
    let elf = create_elf(0x0040_0000, &phdrs, &[0xAA, 0xBB, 0xCC, 0xDD]);
    let snapshot = elf.clone();

    let mut first = RecordingMapper::default();
    let mut second = RecordingMapper::default();
    assert_eq!(load(&elf, &mut first), load(&elf, &mut second));
    assert_eq!(first.calls, second.calls);
    assert_eq!(elf, snapshot);
}

#[test]
fn truncated_program_header_table_maps_nothing() {
    let seg = [PT_LOAD, 0, 0x1000, 0, 0, 0x10, PF_R, 0];
    let mut elf = create_elf(0x1000, &[seg, seg], &[]);
    elf.truncate(elf.len() - 1);

    let mut mapper = RecordingMapper::default();
    assert_eq!(
        load(&elf, &mut mapper),
        Err(LoadError::Format(ElfError::ProgramHeaderTableOutOfBounds))
    );
    assert!(mapper.calls.is_empty());
}

#[test]
fn program_header_offset_past_end_is_rejected() {
    let seg = [PT_LOAD, 0, 0x1000, 0, 0, 0x10, PF_R, 0];
    let mut elf = create_elf(0x1000, &[seg], &[]);
    elf[28..32].copy_from_slice(&0xFFFF_FFF0u32.to_ne_bytes());

    let mut mapper = RecordingMapper::default();
    assert_eq!(
        load(&elf, &mut mapper),
        Err(LoadError::Format(ElfError::ProgramHeaderTableOutOfBounds))
    );
    assert!(mapper.calls.is_empty());
}

#[test]
fn closure_collaborator_sees_segments() {
    let base = payload_offset(1);
    let elf = create_elf(0x2000, &[[PT_LOAD, base, 0x2000, 0, 1, 1, PF_R, 0]], &[0x42]);

    let mut seen = Vec::new();
    let mut mapper = |segment: &Segment<'_>| -> Result<(), ()> {
        seen.push((segment.vaddr, segment.data.to_vec()));
        Ok(())
    };
    assert_eq!(load(&elf, &mut mapper), Ok(0x2000));
    assert_eq!(seen, vec![(0x2000, vec![0x42])]);
}

#[test]
fn big_endian_image_with_strict_config() {
    let mut elf = vec![0u8; 52];
    elf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    elf[4] = 1;
    elf[5] = 2; // ELFDATA2MSB
    elf[6] = 1;
    elf[24..28].copy_from_slice(&0x8002_0000u32.to_be_bytes());
    elf[28..32].copy_from_slice(&52u32.to_be_bytes());
    elf[42..44].copy_from_slice(&32u16.to_be_bytes());
    elf[44..46].copy_from_slice(&1u16.to_be_bytes());
    for field in [PT_LOAD, 84, 0x8002_0000, 0, 2, 4, PF_R | PF_X, 0x1000] {
        elf.extend_from_slice(&field.to_be_bytes());
    }
    elf.extend_from_slice(&[0x12, 0x34]);

    let mut mapper = RecordingMapper::default();
    let loader = Elf32Loader::new(LoaderConfig::strict());
    assert_eq!(loader.load(&elf, &mut mapper), Ok(0x8002_0000));
    assert_eq!(mapper.calls[0].data, vec![0x12, 0x34]);

    let forced = Elf32Loader::new(LoaderConfig::strict().byte_order(ByteOrder::Big));
    assert_eq!(forced.load(&elf, &mut RecordingMapper::default()), Ok(0x8002_0000));
}

#[test]
fn strict_config_rejects_inverted_sizes() {
    let elf = create_elf(0x1000, &[[PT_LOAD, 0, 0x1000, 0, 0x20, 0x10, PF_R, 0]], &[]);

    let mut mapper = RecordingMapper::default();
    assert!(load(&elf, &mut mapper).is_ok());

    let mut mapper = RecordingMapper::default();
    assert_eq!(
        Elf32Loader::new(LoaderConfig::strict()).load(&elf, &mut mapper),
        Err(LoadError::Format(ElfError::InvalidMemSize { index: 0 }))
    );
    assert!(mapper.calls.is_empty());
}

#[test]
fn shared_flat_mapper_across_images() {
    let base = payload_offset(1);
    let first = create_elf(0x100, &[[PT_LOAD, base, 0x100, 0, 2, 4, PF_R, 0]], &[1, 2]);
    let second = create_elf(0x200, &[[PT_LOAD, base, 0x200, 0, 1, 8, PF_R | PF_W, 0]], &[3]);

    let mut memory = [0xEEu8; 0x400];
    let shared = spin::Mutex::new(FlatMemoryMapper::new(&mut memory, 0));

    assert_eq!(load(&first, &mut SharedMapper::new(&shared)), Ok(0x100));
    assert_eq!(load(&second, &mut SharedMapper::new(&shared)), Ok(0x200));
    assert_eq!(shared.lock().mapped_segments(), 2);
    drop(shared);

    assert_eq!(&memory[0x100..0x104], &[1, 2, 0, 0]);
    assert_eq!(&memory[0x200..0x208], &[3, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(memory[0x208], 0xEE);
}

#[test]
fn shared_flat_mapper_across_threads() {
    fn assert_send<T: Send>() {}
    assert_send::<SharedMapper<'_, FlatMemoryMapper<'_>>>();

    let base = payload_offset(1);
    let images: Vec<Vec<u8>> = (1..=4u32)
        .map(|i| {
            let vaddr = i * 0x100;
            let seg = [PT_LOAD, base, vaddr, 0, 2, 0x10, PF_R | PF_W, 0];
            create_elf(vaddr + 4, &[seg], &[i as u8, 0xA0 | i as u8])
        })
        .collect();

    let mut memory = [0xEEu8; 0x600];
    let shared = spin::Mutex::new(FlatMemoryMapper::new(&mut memory, 0));

    let entries: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = images
            .iter()
            .map(|image| {
                let shared = &shared;
                scope.spawn(move || load(image, &mut SharedMapper::new(shared)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(entries, [Ok(0x104), Ok(0x204), Ok(0x304), Ok(0x404)]);
    assert_eq!(shared.lock().mapped_segments(), 4);
    assert_eq!(shared.lock().highest_address(), 0x1000);
    drop(shared);

    for i in 1..=4usize {
        let start = i * 0x100;
        assert_eq!(&memory[start..start + 2], &[i as u8, 0xA0 | i as u8]);
        assert!(memory[start + 2..start + 0x10].iter().all(|&b| b == 0));
        assert_eq!(memory[start + 0x10], 0xEE);
    }
}

#[test]
fn custom_collaborator_counts_loadable_segments() {
    struct Counter(usize);

    impl MapSegment for Counter {
        type Error = ();

        fn map_segment(&mut self, _segment: &Segment<'_>) -> Result<(), ()> {
            self.0 += 1;
            Ok(())
        }
    }

    let seg = [PT_LOAD, 0, 0x1000, 0, 0, 0x10, PF_R, 0];
    let elf = create_elf(0x1000, &[seg, [PT_NULL; 8], seg], &[]);
    let mut counter = Counter(0);
    assert!(load(&elf, &mut counter).is_ok());
    assert_eq!(counter.0, 2);
}
