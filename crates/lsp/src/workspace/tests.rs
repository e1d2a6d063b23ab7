use pretty_assertions::assert_eq;

use super::*;
use crate::test_support::FakeWindow;

fn paths(items: &[&str]) -> Vec<PathBuf> {
	items.iter().map(PathBuf::from).collect()
}

#[test]
fn test_folder_name_is_last_component() {
	let folder = WorkspaceFolder::from_path("/home/u/project");
	assert_eq!(folder.name, "project");
	assert!(folder.includes_path(Path::new("/home/u/project/src/lib.rs")));
	assert!(!folder.includes_path(Path::new("/home/u/project-other/lib.rs")));
}

#[test]
fn test_sorted_folders_put_deepest_match_first() {
	let folders = paths(&["/a", "/other", "/a/b", "/a/b/c"]);
	let sorted = sorted_workspace_folders(&folders, Path::new("/a/b/file.rs"));
	let order: Vec<_> = sorted.iter().map(|f| f.path.clone()).collect();
	assert_eq!(order, paths(&["/a/b", "/a", "/other", "/a/b/c"]));
}

#[test]
fn test_update_classifies_changes() {
	let window = FakeWindow::new(1, &["/p1"]);
	let project = ProjectFolders::new(window.clone());
	assert_eq!(project.update(), FolderChange::Unchanged);

	window.set_folders(&["/p1", "/p2"]);
	assert_eq!(
		project.update(),
		FolderChange::Changed {
			added: paths(&["/p2"]),
			removed: vec![],
		}
	);

	window.set_folders(&["/q"]);
	assert_eq!(project.update(), FolderChange::Switched);
	assert_eq!(project.folders(), paths(&["/q"]));
}

#[test]
fn test_opening_first_folder_is_not_a_switch() {
	let window = FakeWindow::new(1, &[]);
	let project = ProjectFolders::new(window.clone());
	window.set_folders(&["/p"]);
	assert!(matches!(project.update(), FolderChange::Changed { .. }));
}

#[test]
fn test_includes_path_and_project_path() {
	let window = FakeWindow::new(1, &[]);
	let project = ProjectFolders::new(window.clone());
	assert!(project.includes_path(Path::new("/anywhere/x.rs")));

	window.set_folders(&["/ws", "/ws/crates/core"]);
	project.update();
	assert!(!project.includes_path(Path::new("/elsewhere/x.rs")));
	assert_eq!(project.project_path(Path::new("/ws/crates/core/src/lib.rs")), Some(PathBuf::from("/ws/crates/core")));
	assert_eq!(project.project_path(Path::new("/ws/README.md")), Some(PathBuf::from("/ws")));
	assert_eq!(project.project_path(Path::new("/elsewhere")), None);
}
