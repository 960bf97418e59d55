use super::*;
use tempfile::tempdir;

fn write_entry(dir: &Path, relative: &str, content: &str) {
    let path = dir.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn app(name: &str) -> String {
    format!("[Desktop Entry]\nType=Application\nName={}\nExec={}\n", name, name)
}

#[test]
fn test_parse_desktop_entry() {
    assert_eq!(parse_desktop_entry(&app("Firefox")).as_deref(), Some("Firefox"));
    assert_eq!(
        parse_desktop_entry("[Desktop Entry]\nName=Hidden\nNoDisplay=true\n"),
        None
    );
    assert_eq!(
        parse_desktop_entry("[Desktop Entry]\nType=Link\nName=Docs\n"),
        None
    );
    assert_eq!(
        parse_desktop_entry("[Desktop Entry]\nName=Main\n[Desktop Action new]\nName=Other\n")
            .as_deref(),
        Some("Main")
    );
}

#[test]
fn test_catalog_sorts_shadows_and_excludes_self() {
    let user = tempdir().unwrap();
    let system = tempdir().unwrap();
    write_entry(user.path(), "zed.desktop", &app("Zed"));
    write_entry(user.path(), "firefox.desktop", &app("Firefox Custom"));
    write_entry(system.path(), "firefox.desktop", &app("Firefox"));
    write_entry(system.path(), "kde/konsole.desktop", &app("Konsole"));
    write_entry(system.path(), "tunnel-session.desktop", &app("Tunnel"));
    write_entry(system.path(), "notes.txt", "not an entry");

    let catalog = DesktopEntryCatalog::new(
        vec![
            CatalogRoot {
                dir: user.path().to_path_buf(),
                system: false,
            },
            CatalogRoot {
                dir: system.path().to_path_buf(),
                system: true,
            },
        ],
        OWN_DESKTOP_ID,
    );

    let apps = catalog.installed_apps().unwrap();

    assert_eq!(
        apps,
        vec![
            InstalledApp {
                package_name: "firefox".to_string(),
                app_name: "Firefox Custom".to_string(),
                is_system_app: false,
            },
            InstalledApp {
                package_name: "kde-konsole".to_string(),
                app_name: "Konsole".to_string(),
                is_system_app: true,
            },
            InstalledApp {
                package_name: "zed".to_string(),
                app_name: "Zed".to_string(),
                is_system_app: false,
            },
        ]
    );
}

#[test]
fn test_missing_roots_are_skipped() {
    let catalog = DesktopEntryCatalog::new(
        vec![CatalogRoot {
            dir: PathBuf::from("/nonexistent/applications"),
            system: true,
        }],
        OWN_DESKTOP_ID,
    );

    assert!(catalog.installed_apps().unwrap().is_empty());
}
