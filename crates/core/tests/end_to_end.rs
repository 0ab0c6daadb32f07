//! Drives the whole conversion pipeline — config, history builder, object
//! pipeline, `git2` sink — end to end against a real bare repository,
//! mirroring the trunk/branches/tags-with-merge scenario from the design
//! notes: create `trunk`, branch to `feat`, modify `feat`, merge back via
//! `svn:mergeinfo`.

use std::collections::BTreeMap;
use std::sync::Arc;

use svn2git_core::authors::AuthorsMap;
use svn2git_core::config::rules::RuleSet;
use svn2git_core::config::schema::parse_document;
use svn2git_core::history::HistoryBuilder;
use svn2git_core::model::{CopyFrom, DumpNode, DumpRevision, NodeAction, NodeContent, NodeKind};
use svn2git_core::pipeline::git_sink::Git2Sink;
use svn2git_core::pipeline::ObjectPipeline;
use svn2git_core::transform::Passthrough;

fn rules() -> RuleSet {
    let doc = parse_document(
        r#"<Config><Default>
            <MapPath Path="trunk" Refname="refs/heads/main"/>
            <MapPath Path="branches/*" Refname="refs/heads/$1"/>
        </Default></Config>"#,
    )
    .unwrap();
    RuleSet::resolve(&doc, &[]).unwrap()
}

fn dir_node(path: &str) -> DumpNode {
    DumpNode {
        path: path.to_string(),
        kind: NodeKind::Dir,
        action: NodeAction::Add,
        copyfrom: None,
        props: BTreeMap::new(),
        props_present: false,
        content: NodeContent::None,
        content_md5: None,
        content_sha1: None,
    }
}

fn file_node(path: &str, action: NodeAction, bytes: &[u8]) -> DumpNode {
    DumpNode {
        path: path.to_string(),
        kind: NodeKind::File,
        action,
        copyfrom: None,
        props: BTreeMap::new(),
        props_present: false,
        content: NodeContent::Full(bytes.to_vec()),
        content_md5: None,
        content_sha1: None,
    }
}

fn revision(rev: u64, log: &str) -> DumpRevision {
    DumpRevision {
        rev,
        author: Some("alice".to_string()),
        date: Some("2024-01-01T00:00:00Z".to_string()),
        log: Some(log.to_string()),
        nodes: Vec::new(),
    }
}

#[tokio::test]
async fn trunk_branch_merge_produces_expected_refs_and_commit_graph() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Git2Sink::init_bare(dir.path()).unwrap();
    let pipeline = ObjectPipeline::new(sink, Arc::new(Passthrough));
    let authors = AuthorsMap::empty();
    let rules = rules();
    let mut builder = HistoryBuilder::new(&rules).unwrap();

    async fn execute(
        pipeline: &ObjectPipeline<Git2Sink>,
        builder: &mut HistoryBuilder<'_>,
        outcome: svn2git_core::history::RevisionOutcome,
    ) {
        for commit in outcome.commits {
            for file in &commit.files {
                pipeline
                    .stage_blob(&commit.refname, &file.path, &BTreeMap::new(), &file.content, file.mode, "fmt")
                    .await
                    .unwrap();
            }
            let tree = pipeline.write_tree(&commit.refname).await.unwrap();
            let sha = pipeline
                .commit(
                    &commit.refname,
                    &tree,
                    &commit.parents,
                    &commit.author,
                    &commit.committer,
                    commit.timestamp,
                    &commit.message,
                )
                .await
                .unwrap();
            pipeline.update_ref(&commit.refname, &sha, None).await.unwrap();
            builder.record_commit(&commit.refname, commit.svn_rev, sha, commit.parents);
        }
    }

    // r1: trunk/a.txt
    builder.begin_revision(1);
    builder.apply_node(&dir_node("trunk")).unwrap();
    builder.apply_node(&file_node("trunk/a.txt", NodeAction::Add, b"hello")).unwrap();
    let r1 = builder.close_revision(&revision(1, "initial import"), &authors, false).unwrap();
    assert_eq!(r1.commits.len(), 1);
    execute(&pipeline, &mut builder, r1).await;

    // r2: branch trunk -> branches/feat
    builder.begin_revision(2);
    let mut copy = dir_node("branches/feat");
    copy.copyfrom = Some(CopyFrom { path: "trunk".to_string(), rev: 1 });
    builder.apply_node(&copy).unwrap();
    let r2 = builder
        .close_revision(&revision(2, "branch feat from trunk"), &authors, false)
        .unwrap();
    assert_eq!(r2.commits.len(), 1);
    assert_eq!(r2.commits[0].refname, "refs/heads/feat");
    execute(&pipeline, &mut builder, r2).await;

    // r3: modify on feat
    builder.begin_revision(3);
    builder
        .apply_node(&file_node("branches/feat/a.txt", NodeAction::Change, b"hello from feat"))
        .unwrap();
    let r3 = builder.close_revision(&revision(3, "work on feat"), &authors, false).unwrap();
    assert_eq!(r3.commits.len(), 1);
    execute(&pipeline, &mut builder, r3).await;

    // r4: unrelated work on trunk so the later merge can't collapse to a
    // fast-forward.
    builder.begin_revision(4);
    builder
        .apply_node(&file_node("trunk/other.txt", NodeAction::Add, b"unrelated"))
        .unwrap();
    let r4 = builder.close_revision(&revision(4, "unrelated trunk work"), &authors, false).unwrap();
    execute(&pipeline, &mut builder, r4).await;

    // r5: merge feat back into trunk via svn:mergeinfo.
    builder.begin_revision(5);
    let mut mergeinfo_node = dir_node("trunk");
    mergeinfo_node.action = NodeAction::Change;
    mergeinfo_node.props_present = true;
    mergeinfo_node
        .props
        .insert("svn:mergeinfo".to_string(), b"/branches/feat:2-3".to_vec());
    builder.apply_node(&mergeinfo_node).unwrap();
    builder
        .apply_node(&file_node("trunk/a.txt", NodeAction::Change, b"hello from feat"))
        .unwrap();
    let r5 = builder.close_revision(&revision(5, "merge feat to trunk"), &authors, false).unwrap();
    assert_eq!(r5.commits.len(), 1);
    let merge_commit = r5.commits[0].clone();
    assert_eq!(merge_commit.refname, "refs/heads/main");
    assert!(!merge_commit.is_fast_forward);
    assert_eq!(merge_commit.parents.len(), 2);
    execute(&pipeline, &mut builder, r5).await;

    let deleted = builder.finalize_deleted_refs();
    assert!(deleted.is_empty());

    let repo = git2::Repository::open(dir.path()).unwrap();
    let main_tip = repo.find_reference("refs/heads/main").unwrap().peel_to_commit().unwrap();
    let feat_tip = repo.find_reference("refs/heads/feat").unwrap().peel_to_commit().unwrap();
    assert_eq!(main_tip.parent_count(), 2);

    let mut reachable_from_main = std::collections::HashSet::new();
    let mut stack = vec![main_tip.id()];
    while let Some(id) = stack.pop() {
        if !reachable_from_main.insert(id) {
            continue;
        }
        let commit = repo.find_commit(id).unwrap();
        stack.extend(commit.parent_ids());
    }
    assert!(reachable_from_main.contains(&feat_tip.id()), "feat's tip should be an ancestor of the merge commit");

    let tree = main_tip.tree().unwrap();
    assert!(tree.get_path(std::path::Path::new("a.txt")).is_ok());
    assert!(tree.get_path(std::path::Path::new("other.txt")).is_ok());
}
