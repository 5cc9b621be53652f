use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn leads_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("leads");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    // Tiny batch size so multi-batch commits are exercised; tiny lexical
    // candidate pool so the filter-driven over-fetch path is exercised.
    let config_content = format!(
        r#"[db]
path = "{root}/data/leads.db"

[index]
dir = "{root}/data/index"

[status]
path = "{root}/data/status.json"

[ingest]
batch_size = 2

[retrieval]
candidate_k_lexical = 1
final_k = 12
"#,
        root = root.display()
    );

    let config_path = config_dir.join("leads.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

/// A zip with one CSV member using renamed columns (the normalizer must
/// map them) and one unrelated member that must not match the pattern.
fn write_fixture_zip(dir: &Path) -> PathBuf {
    let zip_path = dir.join("leads.zip");
    let file = fs::File::create(&zip_path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    zip.start_file("alpha.csv", options).unwrap();
    zip.write_all(
        b"Full Name,Employer,E-mail,Job Title,City,Category,Followers\n\
          Anna Schmidt,Bauwerk GmbH,anna@bauwerk.example,Software Architect,Munich,tech,12000\n\
          Pierre Dubois,Boulangerie SA,pierre@pain.example,Food Blogger,Paris,food,900\n\
          Lena Fischer,FitStudio,lena@fit.example,Trainer,Berlin,fitness,15000\n",
    )
    .unwrap();

    zip.start_file("beta.csv", options).unwrap();
    zip.write_all(
        b"name,company,email,title,city,category,followers\n\
          Marco Rossi,Gymspace,marco@gym.example,Gym Owner,Milan,fitness,3000\n\
          Julia Weber,Gymtech,julia@gymtech.example,Gym Engineer,Berlin,tech,50\n",
    )
    .unwrap();

    zip.start_file("notes.txt", options).unwrap();
    zip.write_all(b"not a spreadsheet").unwrap();

    zip.finish().unwrap();
    zip_path
}

/// A minimal XLSX (shared strings + one worksheet) wrapped in a dataset zip.
fn write_xlsx_zip(dir: &Path) -> PathBuf {
    let shared_strings = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="6" uniqueCount="6">
<si><t>Full Name</t></si>
<si><t>Employer</t></si>
<si><t>E-mail</t></si>
<si><t>Sofia Almeida</t></si>
<si><t>Porto Digital</t></si>
<si><t>sofia@porto.example</t></si>
</sst>"#;

    let sheet = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<sheetData>
<row r="1">
<c r="A1" t="s"><v>0</v></c>
<c r="B1" t="s"><v>1</v></c>
<c r="C1" t="s"><v>2</v></c>
</row>
<row r="2">
<c r="A2" t="s"><v>3</v></c>
<c r="B2" t="s"><v>4</v></c>
<c r="C2" t="s"><v>5</v></c>
</row>
</sheetData>
</worksheet>"#;

    let mut xlsx_bytes = Vec::new();
    {
        let mut xlsx = zip::ZipWriter::new(std::io::Cursor::new(&mut xlsx_bytes));
        let options = SimpleFileOptions::default();
        xlsx.start_file("xl/sharedStrings.xml", options).unwrap();
        xlsx.write_all(shared_strings.as_bytes()).unwrap();
        xlsx.start_file("xl/worksheets/sheet1.xml", options).unwrap();
        xlsx.write_all(sheet.as_bytes()).unwrap();
        xlsx.finish().unwrap();
    }

    let zip_path = dir.join("xlsx_leads.zip");
    let file = fs::File::create(&zip_path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file("gamma.xlsx", SimpleFileOptions::default())
        .unwrap();
    zip.write_all(&xlsx_bytes).unwrap();
    zip.finish().unwrap();
    zip_path
}

fn run_leads(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = leads_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run leads binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn ingest_fixture(config_path: &Path, tmp: &TempDir) {
    let zip_path = write_fixture_zip(tmp.path());
    run_leads(config_path, &["init"]);
    let (stdout, stderr, success) = run_leads(
        config_path,
        &[
            "ingest",
            zip_path.to_str().unwrap(),
            "--dataset",
            "eu_leads",
        ],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_leads(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_leads(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_leads(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_normalizes_renamed_columns() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (stdout, _, _) = run_leads(&config_path, &["stats"]);
    assert!(stdout.contains("Rows:        5"), "stats: {}", stdout);

    // Columns "Full Name"/"Employer"/"E-mail" reached name/company/email.
    let (stdout, stderr, success) =
        run_leads(&config_path, &["search", "Anna Schmidt", "--k", "3"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("Anna Schmidt"), "results: {}", stdout);
    assert!(stdout.contains("anna@bauwerk.example"));
    assert!(stdout.contains("Software Architect at Bauwerk GmbH"));
}

#[test]
fn test_ingest_skips_non_matching_members() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (stdout, _, _) = run_leads(&config_path, &["stats"]);
    // notes.txt contributes nothing; only the two CSV members count.
    assert!(stdout.contains("FILES"));
    assert!(stdout.contains("Rows:        5"));
}

#[test]
fn test_reingest_is_noop() {
    let (tmp, config_path) = setup_test_env();
    let zip_path = write_fixture_zip(tmp.path());
    run_leads(&config_path, &["init"]);

    let args = [
        "ingest",
        zip_path.to_str().unwrap(),
        "--dataset",
        "eu_leads",
    ];
    let (stdout1, _, success1) = run_leads(&config_path, &args);
    assert!(success1);
    assert!(stdout1.contains("rows inserted: 5"), "first: {}", stdout1);

    let (stdout2, _, success2) = run_leads(&config_path, &args);
    assert!(success2);
    assert!(stdout2.contains("files skipped (already ingested): 2"), "second: {}", stdout2);
    assert!(stdout2.contains("rows inserted: 0"));

    // Row table count unchanged after the second run.
    let (stats, _, _) = run_leads(&config_path, &["stats"]);
    assert!(stats.contains("Rows:        5"), "stats: {}", stats);
}

#[test]
fn test_search_ranks_relevant_row_first() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (stdout, stderr, success) = run_leads(
        &config_path,
        &["search", "munich software engineer", "--k", "5"],
    );
    assert!(success, "search failed: {}", stderr);

    // The Munich software architect matches two terms and must rank above
    // the single-term Munich row; the Paris food blogger matches none.
    let first = stdout.lines().find(|l| l.starts_with("1.")).unwrap();
    assert!(first.contains("Anna Schmidt"), "results: {}", stdout);
    assert!(!stdout.contains("Pierre Dubois"));
}

#[test]
fn test_lexical_only_reports_null_vector_scores() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    // No embedding provider, no vector index: hybrid degrades to
    // lexical-only with vector reported as null, not an error.
    let (stdout, stderr, success) =
        run_leads(&config_path, &["search", "fitness", "--k", "5"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("vector=null"), "results: {}", stdout);
    assert!(!stdout.contains("No results."));
}

#[test]
fn test_category_filter() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (stdout, stderr, success) = run_leads(
        &config_path,
        &["search", "gym", "--k", "2", "--category", "fitness"],
    );
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("Marco Rossi"), "results: {}", stdout);
    assert!(!stdout.contains("Julia Weber"), "tech row not filtered: {}", stdout);
}

#[test]
fn test_filters_apply_before_truncation() {
    let (tmp, config_path) = setup_test_env();
    run_leads(&config_path, &["init"]);

    // One row that dominates the lexical ranking but fails the filter, one
    // that matches the filter but ranks below the k=1 candidate cutoff.
    let zip_path = tmp.path().join("yoga.zip");
    let file = fs::File::create(&zip_path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file("yoga.csv", SimpleFileOptions::default())
        .unwrap();
    zip.write_all(
        b"name,category,bio\n\
          Yoga One,food,yoga yoga yoga retreat\n\
          Yoga Two,fitness,yoga classes\n",
    )
    .unwrap();
    zip.finish().unwrap();

    let (_, stderr, success) = run_leads(
        &config_path,
        &["ingest", zip_path.to_str().unwrap(), "--dataset", "yoga"],
    );
    assert!(success, "ingest failed: {}", stderr);

    // candidate_k_lexical = 1: the initial pool holds only the food row.
    // The engine must re-query with a larger pool rather than return
    // nothing while a matching row exists in the store.
    let (stdout, stderr, success) = run_leads(
        &config_path,
        &["search", "yoga", "--k", "1", "--category", "fitness"],
    );
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("Yoga Two"), "results: {}", stdout);
    assert!(!stdout.contains("Yoga One"), "results: {}", stdout);
}

#[test]
fn test_min_followers_filter() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (stdout, _, success) = run_leads(
        &config_path,
        &["search", "gym", "--k", "5", "--min-followers", "1000"],
    );
    assert!(success);
    assert!(stdout.contains("Marco Rossi"));
    assert!(!stdout.contains("Julia Weber"), "50-follower row kept: {}", stdout);
}

#[test]
fn test_dataset_filter() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (stdout, _, success) = run_leads(
        &config_path,
        &["search", "munich", "--k", "5", "--dataset", "other_ds"],
    );
    assert!(success);
    assert!(stdout.contains("No results."), "results: {}", stdout);
}

#[test]
fn test_empty_query_fails_fast() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (_, stderr, success) = run_leads(&config_path, &["search", "   "]);
    assert!(!success);
    assert!(stderr.contains("empty"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_k_fails_fast() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (_, stderr, success) = run_leads(&config_path, &["search", "gym", "--k", "0"]);
    assert!(!success);
    assert!(stderr.contains("k must be"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_xlsx_member() {
    let (tmp, config_path) = setup_test_env();
    let zip_path = write_xlsx_zip(tmp.path());
    run_leads(&config_path, &["init"]);

    let (stdout, stderr, success) = run_leads(
        &config_path,
        &[
            "ingest",
            zip_path.to_str().unwrap(),
            "--dataset",
            "pt_leads",
        ],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("rows inserted: 1"), "summary: {}", stdout);

    let (stdout, _, success) = run_leads(&config_path, &["search", "Sofia", "--k", "3"]);
    assert!(success);
    assert!(stdout.contains("Sofia Almeida"), "results: {}", stdout);
    assert!(stdout.contains("sofia@porto.example"));
}

#[test]
fn test_status_file_written_during_ingest() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let status_path = tmp.path().join("data/status.json");
    assert!(status_path.exists(), "status.json missing");
    let content = fs::read_to_string(&status_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(parsed["dataset"], "eu_leads");
    assert!(parsed["files_total"].as_u64().unwrap() >= 2);
}

#[test]
fn test_vectors_pending_requires_provider() {
    let (tmp, config_path) = setup_test_env();
    ingest_fixture(&config_path, &tmp);

    let (_, stderr, success) = run_leads(&config_path, &["vectors", "pending"]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "stderr: {}", stderr);
}
