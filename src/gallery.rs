/// Storage folders of the known gallery sections
const SECTION_FOLDERS: &[(&str, &str)] = &[
  ("blender", "images/gallery/blender"),
  ("robotics", "images/gallery/robotics"),
  ("competition", "images/gallery/competition"),
  ("engineering", "images/gallery/engineering"),
  ("leadership", "images/gallery/leadership"),
  ("education", "images/gallery/education"),
];

const FALLBACK_FOLDER: &str = "images/gallery";

/// Storage path of `filename` within a gallery section.
///
/// Unknown sections land in the shared gallery folder.
pub fn image_path(section_id: &str, filename: &str) -> String {
  let folder = SECTION_FOLDERS
    .iter()
    .find(|(id, _)| *id == section_id)
    .map(|(_, folder)| *folder)
    .unwrap_or(FALLBACK_FOLDER);

  format!("{}/{}", folder, filename)
}
