mod common;

use std::sync::Arc;

use alloy::primitives::address;
use common::{case, cases, index_config, FixtureSource};
use unchained::appearance::BlockAppearanceSet;
use unchained::chunk::{consolidate, IndexChunk};
use unchained::config::IndexConfig;
use unchained::extract::ConservativeFilter;
use unchained::logs::LogGroup;
use unchained::range::FileRange;
use unchained::scrape::{scrape, OutputMode, ScrapeConfig, ScrapeReport};
use unchained::walk::CacheKind;

async fn run(
    source: FixtureSource,
    index: &IndexConfig,
    config: &ScrapeConfig,
) -> anyhow::Result<ScrapeReport> {
    scrape(Arc::new(source), Arc::new(ConservativeFilter), index, config).await
}

fn read_text(index: &IndexConfig, name: &str) -> Option<String> {
    std::fs::read_to_string(index.text_sink_dir().join(name)).ok()
}

fn single_block(block: u64) -> ScrapeConfig {
    ScrapeConfig {
        first_block: block,
        block_count: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn call_and_log_scenario_writes_sorted_text() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_config(dir.path());
    let case = case("call_and_log_13000001");

    let report = run(FixtureSource::new([&case]), &index, &single_block(13_000_001))
        .await
        .unwrap();

    assert_eq!(report.written, [13_000_001]);
    assert_eq!(
        read_text(&index, "013000001.txt").unwrap(),
        "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01\t013000001\t00003\n\
         0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb02\t013000001\t00003\n\
         0xcccccccccccccccccccccccccccccccccccccc03\t013000001\t00003\n"
    );
}

#[tokio::test]
async fn every_case_matches_its_expected_lines() {
    for case in cases().unwrap() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_config(dir.path());
        let result = run(FixtureSource::new([&case]), &index, &single_block(case.block)).await;

        match (&case.fatal, result) {
            (Some(fatal), Err(e)) => {
                assert!(format!("{e:#}").contains(fatal.as_str()), "{}: {e:#}", case.name)
            }
            (None, Ok(_)) => assert_eq!(
                read_text(&index, &format!("{:09}.txt", case.block)),
                case.expected_text(),
                "{}",
                case.name
            ),
            (_, result) => panic!("{}: unexpected outcome {result:?}", case.name),
        }
    }
}

#[tokio::test]
async fn output_is_identical_across_worker_layouts() {
    let cases: Vec<_> = cases()
        .unwrap()
        .into_iter()
        .filter(|it| it.fatal.is_none())
        .collect();
    let first = cases.first().unwrap().block;
    let count = cases.last().unwrap().block - first + 1;

    let mut outputs = Vec::new();
    for (fetch_workers, extract_workers, channel_size) in [(1, 1, 1), (4, 8, 2), (16, 3, 64)] {
        let dir = tempfile::tempdir().unwrap();
        let index = index_config(dir.path());
        let config = ScrapeConfig {
            first_block: first,
            block_count: count,
            fetch_workers,
            extract_workers,
            channel_size,
            ..Default::default()
        };
        run(FixtureSource::new(&cases), &index, &config).await.unwrap();
        outputs.push(
            cases
                .iter()
                .map(|it| read_text(&index, &format!("{:09}.txt", it.block)))
                .collect::<Vec<_>>(),
        );
    }
    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn unknown_trace_type_aborts_without_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_config(dir.path());
    let cases = [
        case("call_and_log_13000001"),
        case("unknown_trace_type_13000003"),
    ];
    let config = ScrapeConfig {
        first_block: 13_000_001,
        block_count: 3,
        fetch_workers: 1,
        extract_workers: 1,
        ..Default::default()
    };

    let err = run(FixtureSource::new(&cases), &index, &config)
        .await
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("selfdestruct2"), "{message}");
    assert!(message.contains("resume from block 13000003"), "{message}");
    assert_eq!(read_text(&index, "013000003.txt"), None);
    assert!(read_text(&index, "013000001.txt").is_some());
}

#[tokio::test]
async fn missing_blocks_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_config(dir.path());
    let config = ScrapeConfig {
        first_block: 13_000_000,
        block_count: 3,
        ..Default::default()
    };

    let report = run(
        FixtureSource::new([&case("call_and_log_13000001")]),
        &index,
        &config,
    )
    .await
    .unwrap();

    assert_eq!(report.written, [13_000_001]);
    assert_eq!(report.skipped, [13_000_000, 13_000_002]);
}

#[tokio::test]
async fn empty_blocks_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_config(dir.path());

    let report = run(
        FixtureSource::new([&case("empty_13000004")]),
        &index,
        &single_block(13_000_004),
    )
    .await
    .unwrap();

    assert_eq!(report.empty, [13_000_004]);
    assert!(!index.text_sink_dir().exists());
}

#[tokio::test]
async fn transport_failure_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_config(dir.path());
    let cases = cases().unwrap();
    let config = ScrapeConfig {
        first_block: 13_000_001,
        block_count: 2,
        fetch_workers: 1,
        extract_workers: 1,
        ..Default::default()
    };

    let err = run(
        FixtureSource::new(&cases).with_broken_block(13_000_001),
        &index,
        &config,
    )
    .await
    .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("connection reset"), "{message}");
    assert!(message.contains("resume from block 13000001"), "{message}");
}

#[tokio::test]
async fn cached_blocks_consolidate_into_a_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_config(dir.path());
    let cases = [
        case("call_and_log_13000001"),
        case("reward_create_and_dedup_13000002"),
    ];
    let config = ScrapeConfig {
        first_block: 13_000_001,
        block_count: 2,
        output: OutputMode::Both,
        cache_logs: true,
        ..Default::default()
    };
    run(FixtureSource::new(&cases), &index, &config).await.unwrap();

    let store = index.cache_store();
    let cached = store
        .read::<BlockAppearanceSet>("013000002")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.len(), 8);
    let logs = store.read::<LogGroup>("013000002").await.unwrap().unwrap();
    assert_eq!(logs.logs.len(), 1);

    let range = FileRange::new(13_000_001, 13_000_002);
    let chunk = consolidate(&store, &index.chain, index.era, range)
        .await
        .unwrap();
    let path = chunk
        .write(&index.layout().folder(CacheKind::Final))
        .await
        .unwrap();
    let chunk = IndexChunk::read(&path, &index.chain, index.era).unwrap();

    let a = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
    let blocks: Vec<_> = chunk
        .lookup(&a)
        .iter()
        .map(|it| (it.block, it.tx_index))
        .collect();
    assert_eq!(
        blocks,
        [(13_000_001, 3), (13_000_002, 0), (13_000_002, 1)]
    );
    assert_eq!(chunk.header.appearance_count, 11);
}

#[tokio::test]
async fn ranges_with_empty_blocks_consolidate() {
    let dir = tempfile::tempdir().unwrap();
    let index = index_config(dir.path());
    let mut empty = case("empty_13000004");
    empty.block = 13_000_003;
    let cases = [
        case("call_and_log_13000001"),
        case("reward_create_and_dedup_13000002"),
        empty,
    ];
    let config = ScrapeConfig {
        first_block: 13_000_001,
        block_count: 3,
        output: OutputMode::Cache,
        ..Default::default()
    };

    let report = run(FixtureSource::new(&cases), &index, &config).await.unwrap();
    assert_eq!(report.written, [13_000_001, 13_000_002]);
    assert_eq!(report.empty, [13_000_003]);
    assert!(!index.text_sink_dir().exists());

    let store = index.cache_store();
    let cached = store
        .read::<BlockAppearanceSet>("013000003")
        .await
        .unwrap()
        .unwrap();
    assert!(cached.is_empty());

    let range = FileRange::new(13_000_001, 13_000_003);
    let chunk = consolidate(&store, &index.chain, index.era, range)
        .await
        .unwrap();
    assert_eq!(chunk.header.appearance_count, 11);
}
