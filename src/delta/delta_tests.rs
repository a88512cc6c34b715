use super::*;

fn apply_all(source: &[u8], windows: &[Window]) -> Vec<u8> {
    let mut out = Vec::new();
    for w in windows {
        let sview = &source[w.sview_offset as usize..(w.sview_offset + w.sview_len) as usize];
        out.extend_from_slice(&w.apply(sview).unwrap());
    }
    out
}

#[test]
fn window_framing_round_trip() {
    let w = Window {
        sview_offset: 7,
        sview_len: 130,
        tview_len: 10,
        ops: vec![
            DeltaOp::CopySource { offset: 0, len: 4 },
            DeltaOp::CopyNew { len: 3 },
            DeltaOp::CopyTarget { offset: 1, len: 3 },
        ],
        new_data: b"xyz".to_vec(),
    };
    for with_header in [true, false] {
        let bytes = write_window_string(&w, with_header);
        if with_header {
            assert!(bytes.starts_with(SVNDIFF_MAGIC));
        }
        assert_eq!(parse_window_string(&bytes).unwrap(), w);
    }
}

#[test]
fn varint_boundaries_survive_framing() {
    let w = Window {
        sview_offset: 0,
        sview_len: 0,
        tview_len: 300,
        ops: vec![DeltaOp::CopyNew { len: 300 }],
        new_data: vec![b'a'; 300],
    };
    let bytes = write_window_string(&w, false);
    let back = parse_window_string(&bytes).unwrap();
    assert_eq!(back, w);
    assert_eq!(back.apply(b"").unwrap(), vec![b'a'; 300]);
}

#[test]
fn target_copy_may_overlap_itself() {
    // Classic run-length trick: one seed byte expanded by an overlapping
    // target copy.
    let w = Window {
        sview_offset: 0,
        sview_len: 0,
        tview_len: 9,
        ops: vec![DeltaOp::CopyNew { len: 1 }, DeltaOp::CopyTarget { offset: 0, len: 8 }],
        new_data: b"x".to_vec(),
    };
    assert_eq!(w.apply(b"").unwrap(), b"xxxxxxxxx".to_vec());
}

#[test]
fn apply_rejects_bad_views() {
    let w = Window {
        sview_offset: 0,
        sview_len: 4,
        tview_len: 4,
        ops: vec![DeltaOp::CopySource { offset: 2, len: 4 }],
        new_data: vec![],
    };
    assert!(w.apply(b"abcd").is_err()); // copy runs past the view
    assert!(w.apply(b"ab").is_err()); // view length mismatch
}

#[test]
fn diff_reconstructs_appended_text() {
    let source: Vec<u8> = (0..200u32).flat_map(|i| format!("line {}\n", i).into_bytes()).collect();
    let mut target = source.clone();
    target.extend_from_slice(b"and one more line\n");
    let windows = diff(&source, &target);
    assert_eq!(apply_all(&source, &windows), target);
    // The shared prefix must come from source copies, not new data.
    let new_bytes: usize = windows.iter().map(|w| w.new_data.len()).sum();
    assert!(new_bytes < 64 + 18, "delta stored {} new bytes", new_bytes);
}

#[test]
fn diff_reconstructs_edits_and_unrelated_text() {
    let source = b"The quick brown fox jumps over the lazy dog".repeat(40);
    let mut target = source.clone();
    target[100] = b'X';
    target.truncate(1200);
    let windows = diff(&source, &target);
    assert_eq!(apply_all(&source, &windows), target);

    let unrelated: Vec<u8> = (0u8..=255).cycle().take(777).collect();
    let windows = diff(&source, &unrelated);
    assert_eq!(apply_all(&source, &windows), unrelated);
}

#[test]
fn diff_chunks_large_targets_into_windows() {
    let source = vec![b'q'; 10];
    let target: Vec<u8> = (0..(WINDOW_SIZE * 2 + 1000))
        .map(|i| (i % 251) as u8)
        .collect();
    let windows = diff(&source, &target);
    assert_eq!(windows.len(), 3);
    assert_eq!(
        windows.iter().map(|w| w.tview_len).sum::<u64>() as usize,
        target.len()
    );
    assert_eq!(apply_all(&source, &windows), target);
}

#[test]
fn diff_of_identical_texts_is_all_source_copy() {
    let text = b"identical bytes on both sides, long enough to cover several blocks of the matcher so the copy op can span it all".repeat(8);
    let windows = diff(&text, &text);
    assert_eq!(apply_all(&text, &windows), text);
    assert_eq!(windows.iter().map(|w| w.new_data.len()).sum::<usize>(), 0);
}
