//! End-to-end ingestion over real `.eml` files, CSV ledgers and a directory
//! document store.

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

use mailledger::config::QuotaConfig;
use mailledger::coordinator::{BatchSummary, Coordinator, Verdict};
use mailledger::fingerprint::Fingerprinter;
use mailledger::ledger::{ContentTable, ProcessingTable};
use mailledger::maintenance;
use mailledger::model::record::ProcessingStatus;
use mailledger::notify::{JsonLinesSink, LogSink};
use mailledger::source::{EmlDirectory, MessageSource};
use mailledger::store::documents::DirectoryStore;
use mailledger::store::quota::QuotaStore;

fn eml(message_id: &str, to: &str, date: &str, subject: &str) -> String {
    format!(
        "From: Loan Desk <desk@bank.example>\r\n\
To: {to}\r\n\
Subject: {subject}\r\n\
Date: {date}\r\n\
Message-ID: <{message_id}>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
Please sign.\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"loan.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--XX--\r\n"
    )
}

struct Workspace {
    root: TempDir,
    content: ContentTable,
    processing: ProcessingTable,
    quota_config: QuotaConfig,
}

impl Workspace {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let data = root.child("data");
        Self {
            content: ContentTable::open(data.child("content_ledger.csv").path(), ',', 8).unwrap(),
            processing: ProcessingTable::open(data.child("processing_ledger.csv").path(), ',')
                .unwrap(),
            quota_config: QuotaConfig {
                capacity: 50,
                safety_margin: 5,
                eviction_batch: 10,
            },
            root,
        }
    }

    fn inbox(&self) -> assert_fs::fixture::ChildPath {
        self.root.child("inbox")
    }

    fn artifacts(&self) -> assert_fs::fixture::ChildPath {
        self.root.child("artifacts")
    }

    fn quota(&self) -> QuotaStore {
        QuotaStore::open(self.root.child("data/quota.bin").path(), &self.quota_config)
    }

    /// One CLI-style run: fresh quota handle, snapshot saved at the end.
    fn run(&self, documents: &DirectoryStore) -> BatchSummary {
        let quota = self.quota();
        let source = EmlDirectory::new(self.inbox().path());
        let messages = source.fetch().unwrap();
        let coordinator = Coordinator::new(
            Fingerprinter::default(),
            &quota,
            &self.content,
            &self.processing,
            documents,
            &LogSink,
        );
        let summary = coordinator.process_batch(&source, &messages, None);
        quota.save().unwrap();
        summary
    }
}

#[test]
fn test_forwarded_copy_reuses_stored_attachment() {
    let ws = Workspace::new();
    ws.inbox()
        .child("001.eml")
        .write_str(&eml("orig@bank", "bob@y.com", "Sat, 22 Jun 2024 10:30:05 +0000", "Loan Agreement"))
        .unwrap();
    ws.inbox()
        .child("002.eml")
        .write_str(&eml("fwd@bank", "carol@z.com", "Sat, 22 Jun 2024 10:30:40 +0000", "LOAN agreement!"))
        .unwrap();

    let documents = DirectoryStore::new(ws.artifacts().path());
    let summary = ws.run(&documents);
    assert_eq!(summary.novel, 1);
    assert_eq!(summary.duplicate, 1);

    ws.artifacts().child("loan.pdf").assert(predicate::path::exists());
    ws.artifacts().child("loan_1.pdf").assert(predicate::path::missing());
    ws.artifacts()
        .child("loan.pdf")
        .assert(predicate::str::starts_with("%PDF-1.4"));

    let processing = ws.processing.records().unwrap();
    assert_eq!(processing.len(), 2);
    assert_eq!(processing[0].artifact_locations, processing[1].artifact_locations);
    assert_eq!(processing[0].content_key, processing[1].content_key);
}

#[test]
fn test_rerun_is_a_no_op() {
    let ws = Workspace::new();
    ws.inbox()
        .child("001.eml")
        .write_str(&eml("orig@bank", "bob@y.com, carol@z.com", "Sat, 22 Jun 2024 10:30:05 +0000", "Loan"))
        .unwrap();
    let documents = DirectoryStore::new(ws.artifacts().path());

    let first = ws.run(&documents);
    assert_eq!(first.deliveries, 2);
    assert_eq!(first.novel, 2);

    let second = ws.run(&documents);
    assert_eq!(second.already_handled, 2);
    assert_eq!(second.novel + second.duplicate, 0);
    assert_eq!(ws.processing.records().unwrap().len(), 2);
    assert_eq!(ws.content.records().unwrap().len(), 1);
}

#[test]
fn test_small_quota_still_recognizes_every_delivery() {
    let mut ws = Workspace::new();
    ws.quota_config = QuotaConfig {
        capacity: 3,
        safety_margin: 1,
        eviction_batch: 1,
    };
    for i in 0..6 {
        ws.inbox()
            .child(format!("{i:03}.eml"))
            .write_str(&eml(
                &format!("m{i}@bank"),
                "bob@y.com",
                &format!("Sat, 22 Jun 2024 1{i}:00:00 +0000"),
                "Statement",
            ))
            .unwrap();
    }
    let documents = DirectoryStore::new(ws.artifacts().path());

    assert_eq!(ws.run(&documents).novel, 6);
    assert!(ws.quota().len() <= 3);

    let again = ws.run(&documents);
    assert_eq!(again.already_handled, 6);
    assert_eq!(ws.processing.records().unwrap().len(), 6);
}

#[test]
fn test_failed_delivery_is_retried_after_purge() {
    let ws = Workspace::new();
    ws.inbox()
        .child("001.eml")
        .write_str(&eml("orig@bank", "bob@y.com", "Sat, 22 Jun 2024 10:30:05 +0000", "Loan"))
        .unwrap();

    // A regular file where the artifact directory should be.
    ws.root.child("blocked").write_str("x").unwrap();
    let broken = DirectoryStore::new(ws.root.child("blocked").path());
    let summary = ws.run(&broken);
    assert_eq!(summary.failed, 1);
    assert!(ws.content.records().unwrap().is_empty());
    assert_eq!(ws.processing.records().unwrap()[0].status, ProcessingStatus::Error);

    // Error records count as handled until an operator purges them.
    assert_eq!(ws.run(&broken).already_handled, 1);

    let quota = ws.quota();
    let stats = maintenance::purge_failed(&ws.processing, &quota).unwrap();
    quota.save().unwrap();
    assert_eq!(stats.processing_rows, 1);

    let documents = DirectoryStore::new(ws.artifacts().path());
    let retry = ws.run(&documents);
    assert_eq!(retry.novel, 1);
    ws.artifacts().child("loan.pdf").assert(predicate::path::exists());
}

#[test]
fn test_ledgers_are_spreadsheet_csv() {
    let ws = Workspace::new();
    ws.inbox()
        .child("001.eml")
        .write_str(&eml("orig@bank", "bob@y.com", "Sat, 22 Jun 2024 10:30:05 +0000", "Loan, final"))
        .unwrap();
    ws.run(&DirectoryStore::new(ws.artifacts().path()));

    let content = ws.root.child("data/content_ledger.csv");
    content.assert(predicate::str::starts_with(
        "\u{feff}First_Seen,Content_Key,Sender,Sent_At,Subject,Attachments,Artifact_Locations",
    ));
    content.assert(predicate::str::contains("\"Loan, final\""));
    content.assert(predicate::str::contains("2024-06-22T10:30:05Z"));

    ws.root
        .child("data/processing_ledger.csv")
        .assert(predicate::str::contains("<orig@bank>,bob@y.com,").and(predicate::str::contains(",Success,")));
}

#[test]
fn test_json_notifications_per_delivery() {
    let ws = Workspace::new();
    ws.inbox()
        .child("001.eml")
        .write_str(&eml("orig@bank", "bob@y.com, carol@z.com", "Sat, 22 Jun 2024 10:30:05 +0000", "Loan"))
        .unwrap();
    let source = EmlDirectory::new(ws.inbox().path());
    let messages = source.fetch().unwrap();
    let quota = ws.quota();
    let documents = DirectoryStore::new(ws.artifacts().path());
    let sink = JsonLinesSink::new(Vec::new());
    let coordinator = Coordinator::new(
        Fingerprinter::default(),
        &quota,
        &ws.content,
        &ws.processing,
        &documents,
        &sink,
    );

    let outcomes = coordinator.process_message(&source, &messages[0]);
    assert!(outcomes.iter().all(|o| o.verdict == Verdict::Novel));
    drop(coordinator);

    let out = String::from_utf8(sink.into_inner()).unwrap();
    let lines: Vec<serde_json::Value> = out
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["recipient"], "bob@y.com");
    assert_eq!(lines[1]["recipient"], "carol@z.com");
    assert_eq!(lines[0]["artifact_locations"], lines[1]["artifact_locations"]);
}
