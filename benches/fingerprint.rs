use chrono::{Duration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};

use mailledger::fingerprint::Fingerprinter;
use mailledger::ledger::{ContentLedger, ContentTable};
use mailledger::model::record::{ContentKey, DuplicateRecord};

fn bench_fingerprint(c: &mut Criterion) {
    let fp = Fingerprinter::default();
    let sent = Utc.with_ymd_and_hms(2024, 6, 22, 10, 30, 0).unwrap();
    let names = ["Loan.pdf", "schedule.xlsx", "terms.docx"];

    c.bench_function("fingerprint_three_attachments", |b| {
        b.iter(|| fp.fingerprint("desk@bank.example", Some(sent), "Re: Loan Agreement", &names))
    });
}

fn bench_ledger_lookup(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let fp = Fingerprinter::default();

    // Cache disabled so every lookup scans.
    let table = ContentTable::open(dir.path().join("content.csv"), ',', 0).unwrap();
    let mut last = ContentKey(String::new());
    for i in 0..1000 {
        let sent_at = start + Duration::minutes(i);
        let key = fp.fingerprint("desk@bank.example", Some(sent_at), "Statement", &["s.pdf"]).key;
        table
            .append(&DuplicateRecord {
                content_key: key.clone(),
                sender: "desk@bank.example".into(),
                sent_at: Some(sent_at),
                subject: "Statement".into(),
                attachment_names: vec!["s.pdf".into()],
                artifact_locations: vec![format!("/artifacts/s_{i}.pdf")],
                first_seen_at: sent_at,
            })
            .unwrap();
        last = key;
    }
    let missing = ContentKey("ffffffffffffffff".into());

    c.bench_function("content_lookup_hit_last_of_1000", |b| {
        b.iter(|| table.lookup(&last).unwrap())
    });
    c.bench_function("content_lookup_miss_1000", |b| {
        b.iter(|| table.lookup(&missing).unwrap())
    });
}

criterion_group!(benches, bench_fingerprint, bench_ledger_lookup);
criterion_main!(benches);
