use criterion::{criterion_group, criterion_main, Criterion};
use scamper_notes_core::{
    scamper_progress, InMemoryStore, NewNote, NoteId, NoteStore, ScamperData, ScamperFields,
    ScamperId, ScamperPatch,
};

fn seeded_store(notes: usize) -> InMemoryStore {
    let store = InMemoryStore::new();
    for index in 0..notes {
        let note = match store.create_note(NewNote {
            title: format!("note {index}"),
            content: "benchmark fixture".to_string(),
        }) {
            Ok(note) => note,
            Err(err) => panic!("failed to seed note: {err}"),
        };
        if index % 2 == 0 {
            let patch = ScamperPatch {
                substitute: Some("swap the medium".to_string()),
                reverse: Some(" ".to_string()),
                ..ScamperPatch::default()
            };
            if let Err(err) = store.upsert_scamper_data(note.id, patch) {
                panic!("failed to seed worksheet: {err}");
            }
        }
    }
    store
}

fn bench_list_notes(c: &mut Criterion) {
    let store = seeded_store(1_000);
    c.bench_function("list_notes_1000", |b| {
        b.iter(|| match store.list_notes() {
            Ok(notes) => notes.len(),
            Err(err) => panic!("list failed: {err}"),
        });
    });
}

fn bench_progress(c: &mut Criterion) {
    let data = ScamperData {
        id: ScamperId(1),
        note_id: NoteId(1),
        fields: ScamperFields {
            substitute: "a".to_string(),
            combine: "   ".to_string(),
            adapt: "b".to_string(),
            ..ScamperFields::default()
        },
    };
    c.bench_function("scamper_progress", |b| b.iter(|| scamper_progress(Some(&data))));
}

criterion_group!(benches, bench_list_notes, bench_progress);
criterion_main!(benches);
