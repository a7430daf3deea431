//! PowerShell scripts that read and write the per-user WinINET proxy settings.

const REG_KEY: &str = r"HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Point the system proxy at `host:port` with the given bypass list.
pub fn set_proxy(host: &str, port: u16, bypass: &[String]) -> String {
    format!(
        r#"$regKey = "{key}"
New-ItemProperty -Path $regKey -Name ProxyEnable -Value 1 -PropertyType DWord -Force | Out-Null
New-ItemProperty -Path $regKey -Name ProxyServer -Value "{host}:{port}" -PropertyType String -Force | Out-Null
New-ItemProperty -Path $regKey -Name ProxyOverride -Value "{bypass}" -PropertyType String -Force | Out-Null"#,
        key = REG_KEY,
        host = escape(host),
        port = port,
        bypass = escape(&bypass.join(";")),
    )
}

/// Switch the system proxy off and clear server and bypass list.
pub fn unset_proxy() -> String {
    format!(
        r#"$regKey = "{key}"
New-ItemProperty -Path $regKey -Name ProxyEnable -Value 0 -PropertyType DWord -Force | Out-Null
New-ItemProperty -Path $regKey -Name ProxyServer -Value "" -PropertyType String -Force | Out-Null
New-ItemProperty -Path $regKey -Name ProxyOverride -Value "" -PropertyType String -Force | Out-Null"#,
        key = REG_KEY,
    )
}

/// Print `true` when the system proxy is on and points at `host:port`.
pub fn is_proxy_connected(host: &str, port: u16) -> String {
    format!(
        r#"$proxyStatus = Get-ItemProperty -Path "{key}"
if ($proxyStatus.ProxyEnable -eq 1 -and $proxyStatus.ProxyServer -eq "{host}:{port}") {{
    Write-Output "true"
}} else {{
    Write-Output "false"
}}"#,
        key = REG_KEY,
        host = escape(host),
        port = port,
    )
}

/// Print the current settings as compact JSON: `{"enabled":bool,"server":"..."}`.
pub fn read_proxy() -> String {
    format!(
        r#"$regKey = "{key}"
$proxyEnable = (Get-ItemProperty -Path $regKey -Name ProxyEnable -ErrorAction SilentlyContinue).ProxyEnable
$proxyServer = (Get-ItemProperty -Path $regKey -Name ProxyServer -ErrorAction SilentlyContinue).ProxyServer
$result = @{{
  enabled = [bool]$proxyEnable
  server = if ($proxyServer) {{ $proxyServer }} else {{ "" }}
}}
$result | ConvertTo-Json -Compress"#,
        key = REG_KEY,
    )
}

/// Escape a value for a double-quoted PowerShell string.
fn escape(value: &str) -> String {
    value.replace('`', "``").replace('"', "`\"").replace('$', "`$")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_proxy_script() {
        let bypass = vec!["localhost".to_string(), "<local>".to_string()];
        let script = set_proxy("127.0.0.1", 8888, &bypass);

        assert!(script.contains("-Name ProxyEnable -Value 1"));
        assert!(script.contains(r#"-Value "127.0.0.1:8888""#));
        assert!(script.contains(r#"-Value "localhost;<local>""#));
    }

    #[test]
    fn test_unset_proxy_clears_everything() {
        let script = unset_proxy();
        assert!(script.contains("-Name ProxyEnable -Value 0"));
        assert!(script.contains(r#"-Name ProxyServer -Value """#));
        assert!(script.contains(r#"-Name ProxyOverride -Value """#));
    }

    #[test]
    fn test_is_connected_script_braces() {
        let script = is_proxy_connected("127.0.0.1", 8888);
        assert!(script.contains(r#"-eq "127.0.0.1:8888") {"#));
        assert!(script.contains("} else {"));
    }

    #[test]
    fn test_read_script_emits_json() {
        assert!(read_proxy().contains("ConvertTo-Json -Compress"));
    }

    #[test]
    fn test_escape_neutralizes_interpolation() {
        assert_eq!(escape(r#"a"$b`"#), r#"a`"`$b``"#);
    }
}
